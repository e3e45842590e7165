//! CloudClient trait for mocking
//!
//! This trait abstracts the CloudSigma client so reconcilers can be exercised
//! against the in-memory mock in unit tests.

use crate::error::CloudError;
use crate::models::*;
use crate::update::ServerUpdate;
use std::collections::BTreeMap;

/// Trait for CloudSigma API client operations
///
/// One instance acts under exactly one identity (service account or an
/// impersonated user); see [`crate::provider::ClientProvider`].
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait CloudClientTrait: Send + Sync {
    /// Region this client talks to
    fn region(&self) -> &str;

    /// Validate credentials and connectivity
    async fn validate_credentials(&self) -> Result<(), CloudError>;

    // Servers
    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server, CloudError>;
    async fn get_server(&self, uuid: &str) -> Result<Server, CloudError>;
    async fn list_servers(&self) -> Result<Vec<Server>, CloudError>;
    async fn update_server(&self, uuid: &str, update: &ServerUpdate) -> Result<Server, CloudError>;
    async fn start_server(&self, uuid: &str) -> Result<(), CloudError>;
    async fn stop_server(&self, uuid: &str) -> Result<(), CloudError>;
    /// Delete a server; with `with_drives` the attached drives are deleted in the same call
    async fn delete_server(&self, uuid: &str, with_drives: bool) -> Result<(), CloudError>;

    // Drives
    async fn get_drive(&self, uuid: &str) -> Result<Drive, CloudError>;
    async fn list_drives(&self) -> Result<Vec<Drive>, CloudError>;
    async fn create_drive(&self, request: &CreateDriveRequest) -> Result<Drive, CloudError>;
    async fn clone_drive(&self, source_uuid: &str, request: &CloneDriveRequest) -> Result<Drive, CloudError>;
    async fn resize_drive(&self, uuid: &str, size: u64) -> Result<Drive, CloudError>;
    async fn delete_drive(&self, uuid: &str) -> Result<(), CloudError>;

    // IPs
    async fn list_ips(&self) -> Result<Vec<FloatingIp>, CloudError>;
    async fn get_ip(&self, address: &str) -> Result<FloatingIp, CloudError>;
    /// Replace the metadata map of an IP. Not a compare-and-swap.
    async fn update_ip_meta(&self, address: &str, meta: &BTreeMap<String, String>) -> Result<FloatingIp, CloudError>;

    // VLANs
    async fn list_vlans(&self) -> Result<Vec<Vlan>, CloudError>;
    async fn get_vlan(&self, uuid: &str) -> Result<Vlan, CloudError>;
    /// Replace the metadata map of a VLAN. Not a compare-and-swap.
    async fn update_vlan_meta(&self, uuid: &str, meta: &BTreeMap<String, String>) -> Result<Vlan, CloudError>;
}
