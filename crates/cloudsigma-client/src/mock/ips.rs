//! IP operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;
use crate::models::*;
use std::collections::BTreeMap;

impl MockCloudClient {
    /// Add an IP to the mock store (for test setup).
    ///
    /// `subscribed` addresses form the static pool.
    pub fn add_ip(&self, address: impl Into<String>, subscribed: bool) {
        let address = address.into();
        let mut state = self.state();
        state.ips.insert(
            address.clone(),
            FloatingIp {
                uuid: address,
                subscription: subscribed.then(|| serde_json::json!({ "id": 1 })),
                server: None,
                meta: BTreeMap::new(),
            },
        );
        super::servers::refresh_ip_attachments(&mut state);
    }

    /// Snapshot of an IP, bypassing failure injection
    pub fn ip(&self, address: &str) -> Option<FloatingIp> {
        self.state().ips.get(address).cloned()
    }
}

pub fn list_ips(client: &MockCloudClient) -> Result<Vec<FloatingIp>, CloudError> {
    client.enter("list_ips")?;
    Ok(client.state().ips.values().cloned().collect())
}

pub fn get_ip(client: &MockCloudClient, address: &str) -> Result<FloatingIp, CloudError> {
    client.enter("get_ip")?;
    client
        .state()
        .ips
        .get(address)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("IP {address} not found")))
}

pub fn update_ip_meta(client: &MockCloudClient, address: &str, meta: &BTreeMap<String, String>) -> Result<FloatingIp, CloudError> {
    client.enter("update_ip_meta")?;
    let mut state = client.state();
    let ip = state
        .ips
        .get_mut(address)
        .ok_or_else(|| CloudError::NotFound(format!("IP {address} not found")))?;
    ip.meta = meta.clone();
    Ok(ip.clone())
}
