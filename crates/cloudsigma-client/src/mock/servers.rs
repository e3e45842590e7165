//! Server operations for MockCloudClient

use super::{MockCloudClient, MockState};
use crate::error::CloudError;
use crate::models::*;
use crate::update::ServerUpdate;

impl MockCloudClient {
    /// Add a server to the mock store (for test setup)
    pub fn add_server(&self, server: Server) {
        let mut state = self.state();
        state.servers.insert(server.uuid.clone(), server);
        refresh_ip_attachments(&mut state);
    }

    /// Simulate the server reaching a new power state
    pub fn set_server_status(&self, uuid: &str, status: ServerStatus) {
        if let Some(server) = self.state().servers.get_mut(uuid) {
            server.status = status;
        }
    }

    /// Snapshot of a server, bypassing access checks
    pub fn server(&self, uuid: &str) -> Option<Server> {
        self.state().servers.get(uuid).cloned()
    }

    /// Snapshot of every server, bypassing access checks
    pub fn servers(&self) -> Vec<Server> {
        self.state().servers.values().cloned().collect()
    }
}

/// Minimal stopped server as returned by the API (for test setup)
pub fn fixture_server(uuid: &str, name: &str) -> Server {
    Server {
        uuid: uuid.to_string(),
        name: name.to_string(),
        status: ServerStatus::Stopped,
        cpu: 1000,
        mem: 1024 * 1024 * 1024,
        vnc_password: Some("secret".to_string()),
        nics: Vec::new(),
        drives: Vec::new(),
        meta: Default::default(),
        tags: Vec::new(),
        extra: serde_json::Map::new(),
    }
}

/// Recompute which server each IP is attached to from the servers' NICs
pub(crate) fn refresh_ip_attachments(state: &mut MockState) {
    let attachments: Vec<(String, String)> = state
        .servers
        .values()
        .flat_map(|server| {
            server.nics.iter().filter_map(move |nic| {
                nic.ip_v4_conf
                    .as_ref()
                    .and_then(|conf| conf.ip.as_ref())
                    .map(|ip| (ip.uuid.clone(), server.uuid.clone()))
            })
        })
        .collect();

    for ip in state.ips.values_mut() {
        ip.server = attachments
            .iter()
            .find(|(address, _)| address == &ip.uuid)
            .map(|(_, server)| ResourceRef::new(server.clone()));
    }
}

pub fn create_server(client: &MockCloudClient, request: &CreateServerRequest) -> Result<Server, CloudError> {
    client.enter("create_server")?;
    let mut state = client.state();

    for attachment in &request.drives {
        if !state.drives.contains_key(&attachment.drive.uuid) {
            return Err(CloudError::InvalidRequest(format!(
                "drive {} does not exist",
                attachment.drive.uuid
            )));
        }
    }

    let uuid = MockCloudClient::next_uuid(&mut state, "5e7a");
    let server = Server {
        uuid: uuid.clone(),
        name: request.name.clone(),
        status: ServerStatus::Stopped,
        cpu: request.cpu,
        mem: request.mem,
        vnc_password: Some(request.vnc_password.clone()),
        nics: request.nics.clone(),
        drives: request.drives.clone(),
        meta: request.meta.clone(),
        tags: Vec::new(),
        extra: serde_json::Map::new(),
    };
    for attachment in &request.drives {
        if let Some(drive) = state.drives.get_mut(&attachment.drive.uuid) {
            drive.mounted_on.push(ResourceRef::new(uuid.clone()));
        }
    }
    state.servers.insert(uuid, server.clone());
    refresh_ip_attachments(&mut state);
    Ok(server)
}

pub fn get_server(client: &MockCloudClient, uuid: &str) -> Result<Server, CloudError> {
    client.enter("get_server")?;
    let state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    state
        .servers
        .get(uuid)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("Server {uuid} not found")))
}

pub fn list_servers(client: &MockCloudClient) -> Result<Vec<Server>, CloudError> {
    client.enter("list_servers")?;
    let state = client.state();
    Ok(state
        .servers
        .values()
        .filter(|server| !state.denied.contains(&server.uuid))
        .cloned()
        .collect())
}

pub fn update_server(client: &MockCloudClient, uuid: &str, update: &ServerUpdate) -> Result<Server, CloudError> {
    client.enter("update_server")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;

    let body = serde_json::to_value(update)?;
    for field in crate::update::READ_ONLY_SERVER_FIELDS {
        if body.get(*field).is_some() {
            return Err(CloudError::InvalidRequest(format!("{field} is read-only")));
        }
    }

    let server = state
        .servers
        .get_mut(uuid)
        .ok_or_else(|| CloudError::NotFound(format!("Server {uuid} not found")))?;
    server.name = update.name.clone();
    server.cpu = update.cpu;
    server.mem = update.mem;
    server.vnc_password = update.vnc_password.clone();
    server.nics = update.nics.clone();
    server.drives = update.drives.clone();
    server.meta = update.meta.clone();
    server.tags = update.tags.clone();
    server.extra = update.extra.clone();
    let updated = server.clone();

    refresh_ip_attachments(&mut state);
    Ok(updated)
}

pub fn start_server(client: &MockCloudClient, uuid: &str) -> Result<(), CloudError> {
    client.enter("start_server")?;
    set_status(client, uuid, ServerStatus::Starting)
}

pub fn stop_server(client: &MockCloudClient, uuid: &str) -> Result<(), CloudError> {
    client.enter("stop_server")?;
    set_status(client, uuid, ServerStatus::Stopped)
}

fn set_status(client: &MockCloudClient, uuid: &str, status: ServerStatus) -> Result<(), CloudError> {
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    let server = state
        .servers
        .get_mut(uuid)
        .ok_or_else(|| CloudError::NotFound(format!("Server {uuid} not found")))?;
    server.status = status;
    Ok(())
}

pub fn delete_server(client: &MockCloudClient, uuid: &str, with_drives: bool) -> Result<(), CloudError> {
    client.enter("delete_server")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;

    let server = state
        .servers
        .get(uuid)
        .ok_or_else(|| CloudError::NotFound(format!("Server {uuid} not found")))?;
    if server.status != ServerStatus::Stopped {
        return Err(CloudError::InvalidRequest(format!("Server {uuid} must be stopped before deletion")));
    }

    let attached: Vec<String> = server.drives.iter().map(|d| d.drive.uuid.clone()).collect();
    state.servers.remove(uuid);
    for drive_uuid in attached {
        if with_drives {
            state.drives.remove(&drive_uuid);
        } else if let Some(drive) = state.drives.get_mut(&drive_uuid) {
            drive.mounted_on.retain(|s| s.uuid != uuid);
        }
    }
    refresh_ip_attachments(&mut state);
    Ok(())
}
