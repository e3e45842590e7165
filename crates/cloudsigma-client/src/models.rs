//! CloudSigma API models
//!
//! These models match the CloudSigma 2.0 REST API objects.
//! Server-assigned fields the controllers never interpret are kept in
//! flattened `extra` maps so full-object updates can round-trip them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to another resource.
///
/// The API returns either a bare UUID string or an object
/// `{"uuid": ..., "resource_uri": ...}`; references are always sent back as
/// the bare UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawRef", into = "String")]
pub struct ResourceRef {
    /// UUID of the referenced resource
    pub uuid: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRef {
    Uuid(String),
    Object { uuid: String },
}

impl From<RawRef> for ResourceRef {
    fn from(raw: RawRef) -> Self {
        match raw {
            RawRef::Uuid(uuid) | RawRef::Object { uuid } => Self { uuid },
        }
    }
}

impl From<ResourceRef> for String {
    fn from(reference: ResourceRef) -> Self {
        reference.uuid
    }
}

impl ResourceRef {
    /// Reference a resource by UUID
    pub fn new(uuid: impl Into<String>) -> Self {
        Self { uuid: uuid.into() }
    }
}

/// Server power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Server is running
    Running,
    /// Start requested
    Starting,
    /// Stop requested
    Stopping,
    /// Server is stopped
    #[default]
    Stopped,
    /// Server is paused
    Paused,
    /// Host unavailable
    Unavailable,
    /// Any state this client does not know about
    #[serde(other)]
    Unknown,
}

/// Server model matching the CloudSigma server object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    /// Server UUID (server-assigned)
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Power state (server-assigned)
    #[serde(default)]
    pub status: ServerStatus,
    /// CPU in MHz
    pub cpu: u32,
    /// Memory in bytes
    pub mem: u64,
    /// VNC password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_password: Option<String>,
    /// Network interfaces, positional
    #[serde(default)]
    pub nics: Vec<ServerNic>,
    /// Attached drives
    #[serde(default)]
    pub drives: Vec<ServerDrive>,
    /// Free-form metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Tag references
    #[serde(default)]
    pub tags: Vec<ResourceRef>,
    /// Fields this client does not model (owner, permissions, runtime, cpus_instead_of_cores, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One network interface of a server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerNic {
    /// Emulated NIC model (e.g. "virtio")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// MAC address (kept so existing interfaces keep their address across updates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Private VLAN this interface joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<ResourceRef>,
    /// Public IPv4 configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_v4_conf: Option<IpV4Conf>,
    /// Runtime information (server-assigned, never sent back)
    #[serde(default, skip_serializing)]
    pub runtime: Option<NicRuntime>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Public IPv4 configuration of an interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpV4Conf {
    /// Configuration mode
    pub conf: IpConfMode,
    /// Static IP, for `static` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<ResourceRef>,
}

/// IPv4 configuration mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IpConfMode {
    /// Address leased from the cloud DHCP service
    Dhcp,
    /// Address pinned to a subscribed or floating IP
    Static,
    /// Configured inside the guest
    Manual,
}

/// Runtime state of an interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NicRuntime {
    /// IPv4 address currently bound to the interface
    #[serde(default)]
    pub ip_v4: Option<ResourceRef>,
    /// "public" or "private"
    #[serde(default)]
    pub interface_type: Option<String>,
}

/// A drive attachment of a server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDrive {
    /// Boot order (1-based), absent for non-boot drives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    /// Controller channel (e.g. "0:0")
    pub dev_channel: String,
    /// Emulated device ("virtio", "ide")
    pub device: String,
    /// Attached drive. Only the UUID is kept; mount references are dropped.
    pub drive: ResourceRef,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerDrive {
    /// Attach a drive as a virtio device on channel `0:{index}`
    pub fn virtio(drive_uuid: impl Into<String>, index: u32) -> Self {
        Self {
            boot_order: (index == 0).then_some(1),
            dev_channel: format!("0:{index}"),
            device: "virtio".to_string(),
            drive: ResourceRef::new(drive_uuid),
            extra: serde_json::Map::new(),
        }
    }
}

/// Drive lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    /// Being created
    Creating,
    /// Target of a running clone
    CloningDst,
    /// Source of a running clone
    CloningSrc,
    /// Attached to a running server
    Mounted,
    /// Ready and not attached to a running server
    Unmounted,
    /// Being resized
    Resizing,
    /// Not usable
    Unavailable,
    /// Any state this client does not know about
    #[serde(other)]
    Unknown,
}

/// Drive model matching the CloudSigma drive object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Drive {
    /// Drive UUID
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Lifecycle state
    pub status: DriveStatus,
    /// "disk" or "cdrom"
    #[serde(default = "default_media")]
    pub media: String,
    /// Free-form metadata
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Servers the drive is attached to
    #[serde(default)]
    pub mounted_on: Vec<ResourceRef>,
}

fn default_media() -> String {
    "disk".to_string()
}

impl Drive {
    /// Ready for attachment or further actions
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.status, DriveStatus::Unmounted | DriveStatus::Mounted)
    }
}

/// IP object from the `/ips/` endpoint.
///
/// The IP's UUID is the address itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FloatingIp {
    /// The IPv4 address
    pub uuid: String,
    /// Subscription backing a statically purchased address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<serde_json::Value>,
    /// Server the address is currently attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ResourceRef>,
    /// Free-form metadata. Ownership tags are kept here.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl FloatingIp {
    /// The address, as text
    #[must_use]
    pub fn address(&self) -> &str {
        &self.uuid
    }

    /// Whether the address is backed by a purchased subscription
    #[must_use]
    pub fn has_subscription(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| !s.is_null())
    }

    /// UUID of the server this address is attached to, if any
    #[must_use]
    pub fn attached_server(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.uuid.as_str())
    }
}

/// VLAN model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vlan {
    /// VLAN UUID
    pub uuid: String,
    /// Free-form metadata. Cluster ownership is kept here.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Servers with an interface on this VLAN
    #[serde(default)]
    pub servers: Vec<ResourceRef>,
}

/// Request body for creating a server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateServerRequest {
    /// Display name
    pub name: String,
    /// CPU in MHz
    pub cpu: u32,
    /// Memory in bytes
    pub mem: u64,
    /// VNC password
    pub vnc_password: String,
    /// Drives to attach, in boot order
    pub drives: Vec<ServerDrive>,
    /// Network interfaces, positional
    pub nics: Vec<ServerNic>,
    /// Metadata (ownership keys, cloud-init payload)
    pub meta: BTreeMap<String, String>,
}

/// Request body for creating a blank drive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateDriveRequest {
    /// Display name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// "disk"
    pub media: String,
    /// Metadata (ownership keys)
    pub meta: BTreeMap<String, String>,
}

/// Request body for cloning a drive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneDriveRequest {
    /// Name of the clone
    pub name: String,
    /// Metadata of the clone (ownership keys)
    pub meta: BTreeMap<String, String>,
}
