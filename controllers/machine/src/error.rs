//! Controller-specific error types.
//!
//! Maps the failure taxonomy of the machine and cluster reconcilers:
//! cloud errors, store conflicts, and configuration problems that stop the
//! process from starting.

use cloudsigma_client::CloudError;
use controller_common::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Machine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// CloudSigma API error
    #[error("CloudSigma error: {0}")]
    Cloud(#[from] CloudError),

    /// Optimistic status write kept conflicting
    #[error("Conflicting writes to {0}")]
    Conflict(String),

    /// Another writer recorded a different instance ID for the same machine
    #[error("{key}: status already records instance {recorded}, refusing to overwrite with {observed}")]
    InstanceIdConflict {
        /// `namespace/name` of the machine
        key: String,
        /// Instance ID found in the record
        recorded: String,
        /// Instance ID this reconcile wanted to record
        observed: String,
    },

    /// Invalid configuration (startup only)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource is malformed or vanished mid-reconcile
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Polling gave up
    #[error("Timed out: {0}")]
    Timeout(String),

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
            StoreError::NotFound(key) => Self::InvalidResource(format!("{key} no longer exists")),
            StoreError::Kube(e) => Self::Kube(e),
            StoreError::Serialization(e) => Self::Serialization(e),
        }
    }
}

impl ControllerError {
    /// Cloud error behind this failure, if any
    pub fn cloud(&self) -> Option<&CloudError> {
        match self {
            Self::Cloud(e) => Some(e),
            _ => None,
        }
    }
}
