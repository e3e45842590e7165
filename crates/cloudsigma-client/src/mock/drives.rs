//! Drive operations for MockCloudClient

use super::MockCloudClient;
use crate::error::CloudError;
use crate::models::*;
use std::collections::BTreeMap;

impl MockCloudClient {
    /// Add a ready library image (for test setup)
    pub fn add_image(&self, uuid: impl Into<String>, size: u64) {
        let uuid = uuid.into();
        self.state().drives.insert(
            uuid.clone(),
            Drive {
                uuid: uuid.clone(),
                name: format!("image-{uuid}"),
                size,
                status: DriveStatus::Unmounted,
                media: "disk".to_string(),
                meta: BTreeMap::new(),
                mounted_on: Vec::new(),
            },
        );
    }

    /// Add a drive to the mock store (for test setup)
    pub fn add_drive(&self, drive: Drive) {
        self.state().drives.insert(drive.uuid.clone(), drive);
    }

    /// Snapshot of every drive, bypassing access checks
    pub fn drives(&self) -> Vec<Drive> {
        self.state().drives.values().cloned().collect()
    }
}

pub fn get_drive(client: &MockCloudClient, uuid: &str) -> Result<Drive, CloudError> {
    client.enter("get_drive")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;

    let finished = match state.pending_clones.get_mut(uuid) {
        Some(0) => true,
        Some(remaining) => {
            *remaining -= 1;
            false
        }
        None => false,
    };
    if finished {
        state.pending_clones.remove(uuid);
        if let Some(drive) = state.drives.get_mut(uuid) {
            drive.status = DriveStatus::Unmounted;
        }
    }

    state
        .drives
        .get(uuid)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("Drive {uuid} not found")))
}

pub fn list_drives(client: &MockCloudClient) -> Result<Vec<Drive>, CloudError> {
    client.enter("list_drives")?;
    let state = client.state();
    Ok(state
        .drives
        .values()
        .filter(|drive| !state.denied.contains(&drive.uuid))
        .cloned()
        .collect())
}

pub fn create_drive(client: &MockCloudClient, request: &CreateDriveRequest) -> Result<Drive, CloudError> {
    client.enter("create_drive")?;
    let mut state = client.state();
    let uuid = MockCloudClient::next_uuid(&mut state, "d71e");
    let drive = Drive {
        uuid: uuid.clone(),
        name: request.name.clone(),
        size: request.size,
        status: DriveStatus::Unmounted,
        media: request.media.clone(),
        meta: request.meta.clone(),
        mounted_on: Vec::new(),
    };
    state.drives.insert(uuid, drive.clone());
    Ok(drive)
}

pub fn clone_drive(client: &MockCloudClient, source_uuid: &str, request: &CloneDriveRequest) -> Result<Drive, CloudError> {
    client.enter("clone_drive")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, source_uuid)?;

    let source = state
        .drives
        .get(source_uuid)
        .cloned()
        .ok_or_else(|| CloudError::NotFound(format!("Drive {source_uuid} not found")))?;

    let uuid = MockCloudClient::next_uuid(&mut state, "c10e");
    let polls = state.clone_polls;
    let drive = Drive {
        uuid: uuid.clone(),
        name: request.name.clone(),
        size: source.size,
        status: if polls == 0 { DriveStatus::Unmounted } else { DriveStatus::CloningDst },
        media: source.media,
        meta: request.meta.clone(),
        mounted_on: Vec::new(),
    };
    if polls > 0 {
        state.pending_clones.insert(uuid.clone(), polls);
    }
    state.drives.insert(uuid, drive.clone());
    Ok(drive)
}

pub fn resize_drive(client: &MockCloudClient, uuid: &str, size: u64) -> Result<Drive, CloudError> {
    client.enter("resize_drive")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    let drive = state
        .drives
        .get_mut(uuid)
        .ok_or_else(|| CloudError::NotFound(format!("Drive {uuid} not found")))?;
    if size < drive.size {
        return Err(CloudError::InvalidRequest("drives cannot shrink".to_string()));
    }
    drive.size = size;
    Ok(drive.clone())
}

pub fn delete_drive(client: &MockCloudClient, uuid: &str) -> Result<(), CloudError> {
    client.enter("delete_drive")?;
    let mut state = client.state();
    MockCloudClient::check_access(&state, uuid)?;
    state
        .drives
        .remove(uuid)
        .map(|_| ())
        .ok_or_else(|| CloudError::NotFound(format!("Drive {uuid} not found")))
}
