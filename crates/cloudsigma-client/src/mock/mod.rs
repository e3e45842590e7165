//! Mock CloudClient for unit testing
//!
//! This module provides an in-memory implementation of `CloudClientTrait`
//! that can be used in unit tests without a CloudSigma account.
//!
//! The mock is organized into domain-specific modules:
//! - `servers.rs` - server lifecycle and full-object updates
//! - `drives.rs` - drive create/clone/resize/delete
//! - `ips.rs` - IP listing and meta tags
//! - `vlans.rs` - VLAN listing and meta tags
//! - `provider.rs` - `MockProvider` handing out the mock for any identity
//!
//! Tests can deny access to individual UUIDs (403, as for a resource owned
//! by another identity), inject one-shot failures per operation, and read
//! call counters.

mod drives;
mod ips;
mod provider;
mod servers;
mod vlans;

pub use provider::MockProvider;
pub use servers::fixture_server;

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::*;
use crate::update::ServerUpdate;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) servers: BTreeMap<String, Server>,
    pub(crate) drives: BTreeMap<String, Drive>,
    pub(crate) ips: BTreeMap<String, FloatingIp>,
    pub(crate) vlans: BTreeMap<String, Vlan>,
    /// UUIDs the active identity may not read
    pub(crate) denied: HashSet<String>,
    /// Remaining `get_drive` polls before a clone completes
    pub(crate) pending_clones: HashMap<String, usize>,
    /// Polls each new clone stays in `cloning_dst`
    pub(crate) clone_polls: usize,
    /// One-shot failures per operation name
    pub(crate) failures: HashMap<&'static str, VecDeque<CloudError>>,
    pub(crate) calls: HashMap<&'static str, usize>,
    pub(crate) next_id: u64,
}

/// Mock CloudClient for testing
///
/// Cloning the mock shares its state, so a test can keep a handle while the
/// code under test owns another.
#[derive(Debug, Clone)]
pub struct MockCloudClient {
    pub(crate) region: String,
    pub(crate) state: Arc<Mutex<MockState>>,
}

impl Default for MockCloudClient {
    fn default() -> Self {
        Self::new("zrh")
    }
}

impl MockCloudClient {
    /// Create an empty mock for `region`
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a call and pop an injected failure for `op`, if any
    pub(crate) fn enter(&self, op: &'static str) -> Result<(), CloudError> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Fail `uuid` lookups with 403
    pub(crate) fn check_access(state: &MockState, uuid: &str) -> Result<(), CloudError> {
        if state.denied.contains(uuid) {
            return Err(CloudError::PermissionDenied(format!("{uuid} is not accessible")));
        }
        Ok(())
    }

    pub(crate) fn next_uuid(state: &mut MockState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-0000-0000-0000-{:012}", state.next_id)
    }

    /// Make `uuid` unreadable for the active identity (403)
    pub fn deny(&self, uuid: impl Into<String>) {
        self.state().denied.insert(uuid.into());
    }

    /// Make `uuid` readable again
    pub fn allow(&self, uuid: &str) {
        self.state().denied.remove(uuid);
    }

    /// Queue a one-shot failure for the named operation
    /// (e.g. `"update_ip_meta"`)
    pub fn fail_next(&self, op: &'static str, error: CloudError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Number of calls made to the named operation
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// Number of `create_server` calls
    pub fn create_server_calls(&self) -> usize {
        self.calls("create_server")
    }

    /// Number of `clone_drive` calls
    pub fn clone_drive_calls(&self) -> usize {
        self.calls("clone_drive")
    }

    /// Keep new clones in `cloning_dst` for this many `get_drive` polls
    pub fn set_clone_polls(&self, polls: usize) {
        self.state().clone_polls = polls;
    }
}

#[async_trait::async_trait]
impl CloudClientTrait for MockCloudClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn validate_credentials(&self) -> Result<(), CloudError> {
        self.enter("validate_credentials")
    }

    // Servers - delegated to servers module
    async fn create_server(&self, request: &CreateServerRequest) -> Result<Server, CloudError> {
        servers::create_server(self, request)
    }

    async fn get_server(&self, uuid: &str) -> Result<Server, CloudError> {
        servers::get_server(self, uuid)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, CloudError> {
        servers::list_servers(self)
    }

    async fn update_server(&self, uuid: &str, update: &ServerUpdate) -> Result<Server, CloudError> {
        servers::update_server(self, uuid, update)
    }

    async fn start_server(&self, uuid: &str) -> Result<(), CloudError> {
        servers::start_server(self, uuid)
    }

    async fn stop_server(&self, uuid: &str) -> Result<(), CloudError> {
        servers::stop_server(self, uuid)
    }

    async fn delete_server(&self, uuid: &str, with_drives: bool) -> Result<(), CloudError> {
        servers::delete_server(self, uuid, with_drives)
    }

    // Drives - delegated to drives module
    async fn get_drive(&self, uuid: &str) -> Result<Drive, CloudError> {
        drives::get_drive(self, uuid)
    }

    async fn list_drives(&self) -> Result<Vec<Drive>, CloudError> {
        drives::list_drives(self)
    }

    async fn create_drive(&self, request: &CreateDriveRequest) -> Result<Drive, CloudError> {
        drives::create_drive(self, request)
    }

    async fn clone_drive(&self, source_uuid: &str, request: &CloneDriveRequest) -> Result<Drive, CloudError> {
        drives::clone_drive(self, source_uuid, request)
    }

    async fn resize_drive(&self, uuid: &str, size: u64) -> Result<Drive, CloudError> {
        drives::resize_drive(self, uuid, size)
    }

    async fn delete_drive(&self, uuid: &str) -> Result<(), CloudError> {
        drives::delete_drive(self, uuid)
    }

    // IPs - delegated to ips module
    async fn list_ips(&self) -> Result<Vec<FloatingIp>, CloudError> {
        ips::list_ips(self)
    }

    async fn get_ip(&self, address: &str) -> Result<FloatingIp, CloudError> {
        ips::get_ip(self, address)
    }

    async fn update_ip_meta(&self, address: &str, meta: &BTreeMap<String, String>) -> Result<FloatingIp, CloudError> {
        ips::update_ip_meta(self, address, meta)
    }

    // VLANs - delegated to vlans module
    async fn list_vlans(&self) -> Result<Vec<Vlan>, CloudError> {
        vlans::list_vlans(self)
    }

    async fn get_vlan(&self, uuid: &str) -> Result<Vlan, CloudError> {
        vlans::get_vlan(self, uuid)
    }

    async fn update_vlan_meta(&self, uuid: &str, meta: &BTreeMap<String, String>) -> Result<Vlan, CloudError> {
        vlans::update_vlan_meta(self, uuid, meta)
    }
}
