//! VLAN operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;
use crate::models::*;
use std::collections::BTreeMap;

impl MockCloudClient {
    /// Add an unclaimed VLAN (for test setup)
    pub fn add_vlan(&self, uuid: impl Into<String>) {
        let uuid = uuid.into();
        self.state().vlans.insert(
            uuid.clone(),
            Vlan {
                uuid,
                meta: BTreeMap::new(),
                servers: Vec::new(),
            },
        );
    }

    /// Overwrite a VLAN's meta without counting a call (for test setup)
    pub fn set_vlan_meta(&self, uuid: &str, meta: BTreeMap<String, String>) {
        if let Some(vlan) = self.state().vlans.get_mut(uuid) {
            vlan.meta = meta;
        }
    }

    /// Snapshot of a VLAN, bypassing access checks
    pub fn vlan(&self, uuid: &str) -> Option<Vlan> {
        self.state().vlans.get(uuid).cloned()
    }
}

pub fn list_vlans(client: &MockCloudClient) -> Result<Vec<Vlan>, CloudError> {
    client.enter("list_vlans")?;
    let state = client.state();
    Ok(state
        .vlans
        .values()
        .filter(|vlan| !state.denied.contains(&vlan.uuid))
        .cloned()
        .collect())
}

pub fn get_vlan(client: &MockCloudClient, uuid: &str) -> Result<Vlan, CloudError> {
    client.enter("get_vlan")?;
    let state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    state
        .vlans
        .get(uuid)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("VLAN {uuid} not found")))
}

pub fn update_vlan_meta(client: &MockCloudClient, uuid: &str, meta: &BTreeMap<String, String>) -> Result<Vlan, CloudError> {
    client.enter("update_vlan_meta")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    let vlan = state
        .vlans
        .get_mut(uuid)
        .ok_or_else(|| CloudError::NotFound(format!("VLAN {uuid} not found")))?;
    vlan.meta = meta.clone();
    Ok(vlan.clone())
}
