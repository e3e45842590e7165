//! Server creation inputs
//!
//! Drives are prepared first (cloned from the source image or created
//! blank, then grown to the requested size), after which the create-server
//! request is assembled from the machine spec.

use super::ReconcileSettings;
use crate::error::ControllerError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cloudsigma_client::ownership::{self, find_owned_drives, machine_meta};
use cloudsigma_client::{
    CloneDriveRequest, CloudClientTrait, CreateDriveRequest, CreateServerRequest, Drive, DriveStatus,
    IpConfMode, IpV4Conf, ResourceRef, ServerDrive, ServerNic,
};
use crds::{CloudMachine, NicMode, NicSpec};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// Drive meta key recording which `spec.disks` entry a drive backs
pub const DISK_INDEX: &str = "disk-index";

const MIB: u64 = 1024 * 1024;

/// Prepare one ready drive per `spec.disks` entry, in order.
///
/// Unmounted drives left over from an interrupted attempt (same machine
/// uid and disk index) are reused instead of cloned again.
pub async fn prepare_drives(
    client: &dyn CloudClientTrait,
    machine: &CloudMachine,
    uid: &str,
    settings: &ReconcileSettings,
) -> Result<Vec<String>, ControllerError> {
    let name = machine.name_any();
    let existing = if machine.spec.disks.is_empty() {
        Vec::new()
    } else {
        find_owned_drives(client, uid).await?
    };

    let mut uuids = Vec::with_capacity(machine.spec.disks.len());
    for (index, disk) in machine.spec.disks.iter().enumerate() {
        let index_value = index.to_string();
        let mut meta = machine_meta(&name, uid);
        meta.insert(DISK_INDEX.to_string(), index_value.clone());

        let reused = existing
            .iter()
            .find(|d| d.mounted_on.is_empty() && d.meta.get(DISK_INDEX) == Some(&index_value))
            .map(|d| d.uuid.clone());

        let uuid = match (reused, &disk.source_image_id) {
            (Some(uuid), _) => {
                debug!("Reusing drive {} for disk {} of {}", uuid, index, name);
                uuid
            }
            (None, Some(source)) => {
                let request = CloneDriveRequest {
                    name: format!("{name}-disk-{index}"),
                    meta,
                };
                let drive = client.clone_drive(source, &request).await?;
                info!("Cloning image {} into drive {} for {}", source, drive.uuid, name);
                drive.uuid
            }
            (None, None) => {
                let request = CreateDriveRequest {
                    name: format!("{name}-disk-{index}"),
                    size: disk.size_bytes,
                    media: "disk".to_string(),
                    meta,
                };
                let drive = client.create_drive(&request).await?;
                info!("Created blank drive {} for {}", drive.uuid, name);
                drive.uuid
            }
        };

        let drive = wait_for_drive(client, &uuid, settings).await?;
        if drive.size < disk.size_bytes {
            info!("Resizing drive {} from {} to {} bytes", uuid, drive.size, disk.size_bytes);
            client.resize_drive(&uuid, disk.size_bytes).await?;
            wait_for_drive(client, &uuid, settings).await?;
        }
        uuids.push(uuid);
    }

    Ok(uuids)
}

/// Poll a drive until it is ready, bounded by `clone_timeout`
pub async fn wait_for_drive(
    client: &dyn CloudClientTrait,
    uuid: &str,
    settings: &ReconcileSettings,
) -> Result<Drive, ControllerError> {
    let deadline = Instant::now() + settings.clone_timeout;
    loop {
        let drive = client.get_drive(uuid).await?;
        if drive.is_ready() {
            return Ok(drive);
        }
        if drive.status == DriveStatus::Unavailable {
            return Err(ControllerError::InvalidResource(format!("drive {uuid} is unavailable")));
        }
        if Instant::now() >= deadline {
            return Err(ControllerError::Timeout(format!(
                "drive {uuid} still {:?} after {:?}",
                drive.status, settings.clone_timeout
            )));
        }
        debug!("Drive {} is {:?}, waiting", uuid, drive.status);
        sleep(settings.poll_interval).await;
    }
}

/// Network interfaces for the server.
///
/// Precedence per NIC: explicit VLAN, then a static public address, then
/// the cluster network, then public DHCP. No NICs at all means one public
/// DHCP interface.
pub fn build_nics(nics: &[NicSpec], cluster_network: Option<&str>) -> Result<Vec<ServerNic>, ControllerError> {
    let dhcp = || ServerNic {
        model: Some("virtio".to_string()),
        ip_v4_conf: Some(IpV4Conf {
            conf: IpConfMode::Dhcp,
            ip: None,
        }),
        ..ServerNic::default()
    };
    let private = |vlan: &str| ServerNic {
        model: Some("virtio".to_string()),
        vlan: Some(ResourceRef::new(vlan)),
        ..ServerNic::default()
    };

    if nics.is_empty() {
        return Ok(vec![dhcp()]);
    }

    nics.iter()
        .map(|nic| match (&nic.vlan_id, nic.mode, &nic.ip) {
            (Some(vlan), _, _) => Ok(private(vlan)),
            (None, NicMode::Static, Some(ip)) => Ok(ServerNic {
                model: Some("virtio".to_string()),
                ip_v4_conf: Some(IpV4Conf {
                    conf: IpConfMode::Static,
                    ip: Some(ResourceRef::new(ip.as_str())),
                }),
                ..ServerNic::default()
            }),
            (None, NicMode::Static, None) => Err(ControllerError::InvalidResource(
                "static NIC without vlanId needs an ip".to_string(),
            )),
            (None, NicMode::Dhcp, _) => Ok(cluster_network.map_or_else(dhcp, private)),
        })
        .collect()
}

/// Server meta: user meta, ownership keys and the cloud-init payload
pub fn server_meta(machine: &CloudMachine, uid: &str) -> BTreeMap<String, String> {
    let mut meta = machine.spec.meta.clone();
    meta.extend(machine_meta(&machine.name_any(), uid));
    if let Some(user_data) = machine.spec.cloud_init.as_deref().filter(|u| !u.is_empty()) {
        meta.insert(ownership::USER_DATA.to_string(), STANDARD.encode(user_data));
        meta.insert(ownership::BASE64_FIELDS.to_string(), ownership::USER_DATA.to_string());
    }
    meta
}

/// Create-server request for a machine whose drives are ready
pub fn server_request(
    machine: &CloudMachine,
    uid: &str,
    drives: &[String],
    cluster_network: Option<&str>,
) -> Result<CreateServerRequest, ControllerError> {
    let spec = &machine.spec;
    if spec.cpu_mhz == 0 || spec.memory_mb == 0 {
        return Err(ControllerError::InvalidResource(format!(
            "{}: cpuMhz and memoryMb must be positive",
            machine.name_any()
        )));
    }

    let drives = drives
        .iter()
        .zip(0u32..)
        .map(|(uuid, index)| ServerDrive::virtio(uuid.as_str(), index))
        .collect();

    Ok(CreateServerRequest {
        name: machine.name_any(),
        cpu: spec.cpu_mhz,
        mem: spec.memory_mb * MIB,
        vnc_password: uuid::Uuid::new_v4().simple().to_string().chars().take(16).collect(),
        drives,
        nics: build_nics(&spec.nics, cluster_network)?,
        meta: server_meta(machine, uid),
    })
}
