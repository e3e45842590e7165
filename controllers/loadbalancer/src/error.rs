//! Controller-specific error types.

use cloudsigma_client::CloudError;
use controller_common::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the LoadBalancer Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// CloudSigma API error
    #[error("CloudSigma error: {0}")]
    Cloud(#[from] CloudError),

    /// Optimistic write kept conflicting, or a claim was lost to another writer
    #[error("Conflicting writes to {0}")]
    Conflict(String),

    /// No untagged address left in the requested pool
    #[error("Floating IP pool exhausted: {0}")]
    PoolExhausted(String),

    /// No Ready, schedulable node with a CloudSigma server
    #[error("No healthy node: {0}")]
    NoHealthyNode(String),

    /// Invalid configuration (startup only)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Service is malformed (bad pool annotation, no ports)
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Status could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl From<StoreError> for ControllerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(key) => Self::Conflict(key),
            StoreError::NotFound(key) => Self::InvalidResource(format!("{key} not found")),
            StoreError::Kube(e) => Self::Kube(e),
            StoreError::Serialization(e) => Self::Serialization(e),
        }
    }
}

impl ControllerError {
    /// The underlying cloud error, if any
    pub fn cloud(&self) -> Option<&CloudError> {
        match self {
            Self::Cloud(e) => Some(e),
            _ => None,
        }
    }
}
