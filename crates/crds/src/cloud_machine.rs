//! CloudMachine CRD
//!
//! Desired and observed state of one CloudSigma server.

use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "infrastructure.cloudsigma.com",
    version = "v1beta1",
    kind = "CloudMachine",
    namespaced,
    status = "CloudMachineStatus",
    shortname = "csm",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudMachineSpec {
    /// CPU allocation in MHz
    pub cpu_mhz: u32,

    /// Memory allocation in MiB
    pub memory_mb: u64,

    /// Drives attached to the server, in boot order
    #[serde(default)]
    pub disks: Vec<DiskSpec>,

    /// Network interfaces, in attachment order.
    /// An empty list yields a single DHCP interface on the public network.
    #[serde(default)]
    pub nics: Vec<NicSpec>,

    /// Extra server metadata (copied into the server's `meta` map)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Cloud-init user data, injected as opaque base64 server metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<String>,

    /// End-user identity (email) to impersonate against the cloud API.
    /// The controller's own credentials are used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Name of the `CloudCluster` (same namespace) whose network this machine joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

/// One drive of a machine
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Drive size in bytes
    pub size_bytes: u64,

    /// Library or account drive UUID to clone from. A blank drive is created when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_id: Option<String>,
}

/// One network interface of a machine
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NicSpec {
    /// VLAN UUID. Falls back to the cluster network when the machine belongs to a cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<String>,

    /// IPv4 configuration mode for public interfaces
    #[serde(default)]
    pub mode: NicMode,

    /// Static IP (subscription UUID) when `mode` is `Static`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// IPv4 configuration mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NicMode {
    /// Address leased from the cloud DHCP service
    #[default]
    #[serde(alias = "dhcp")]
    Dhcp,

    /// Address pinned to a subscribed IP
    #[serde(alias = "static")]
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudMachineStatus {
    /// UUID of the backing server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Last observed server state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,

    /// Addresses reported by the server's interfaces
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,

    /// True once the server is running
    #[serde(default)]
    pub ready: bool,

    /// `cloudsigma://<uuid>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Observed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last reconciliation failure, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl CloudMachineStatus {
    /// The recorded instance ID, treating an empty string as unset.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Server state as observed on CloudSigma
///
/// Serializes as PascalCase but also accepts the lowercase values
/// the CloudSigma API returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceState {
    /// Server is running
    #[serde(alias = "running")]
    Running,
    /// Start requested, not yet running
    #[serde(alias = "starting")]
    Starting,
    /// Stop requested, not yet stopped
    #[serde(alias = "stopping")]
    Stopping,
    /// Server is stopped
    #[serde(alias = "stopped")]
    Stopped,
    /// Server is paused
    #[serde(alias = "paused")]
    Paused,
    /// Server is unavailable (host maintenance)
    #[serde(alias = "unavailable")]
    Unavailable,
}

/// One address of a machine
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub address_type: AddressType,

    /// The address itself
    pub address: String,
}

/// Machine address kind, named after the Cluster API address types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum AddressType {
    /// Publicly routable address
    ExternalIP,
    /// Address on a private VLAN
    InternalIP,
    /// Server hostname
    Hostname,
}
