//! Ownership metadata
//!
//! CloudSigma has no labels, so ownership of servers, drives, IPs and VLANs
//! is recorded in each resource's `meta` map. These keys are how the
//! controllers find resources they created after losing local state.

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::models::{Drive, Server};
use std::collections::BTreeMap;

/// Value of [`MANAGED_BY`] on every resource the controllers own
pub const MANAGER: &str = "cloudsigma-operator";

/// Meta key naming the managing controller
pub const MANAGED_BY: &str = "managed-by";
/// Meta key holding the CloudMachine name (servers, drives)
pub const MACHINE_NAME: &str = "machine-name";
/// Meta key holding the CloudMachine UID (servers, drives)
pub const MACHINE_UID: &str = "machine-uid";
/// Meta key listing which other meta keys carry base64 payloads
pub const BASE64_FIELDS: &str = "base64_fields";
/// Meta key holding the base64 cloud-init user data
pub const USER_DATA: &str = "cloudinit-user-data";

/// Meta key holding the owning cluster of an IP
pub const IP_CLUSTER: &str = "cluster";
/// Meta key holding the owning Service (`namespace/name`) of an IP
pub const IP_SERVICE: &str = "service";

/// Meta key holding the owning cluster UID of a VLAN
pub const VLAN_CLUSTER_UID: &str = "cluster-uid";
/// Meta key holding the owning cluster name of a VLAN
pub const VLAN_CLUSTER_NAME: &str = "cluster-name";
/// Meta key holding the CIDR the cluster uses on a VLAN
pub const VLAN_CIDR: &str = "cidr";

/// Ownership meta for a machine's server and drives
#[must_use]
pub fn machine_meta(name: &str, uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MACHINE_NAME.to_string(), name.to_string()),
        (MACHINE_UID.to_string(), uid.to_string()),
        (MANAGED_BY.to_string(), MANAGER.to_string()),
    ])
}

/// Whether a resource's meta marks it as created for machine `uid`
#[must_use]
pub fn is_owned_by_machine(meta: &BTreeMap<String, String>, uid: &str) -> bool {
    meta.get(MACHINE_UID).is_some_and(|v| v == uid)
}

/// IP tags binding an address to one Service of one cluster
#[must_use]
pub fn ip_tags(cluster: &str, service_key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (IP_CLUSTER.to_string(), cluster.to_string()),
        (IP_SERVICE.to_string(), service_key.to_string()),
        (MANAGED_BY.to_string(), MANAGER.to_string()),
    ])
}

/// Service (`namespace/name`) an IP is tagged for, when tagged by `cluster`
#[must_use]
pub fn ip_owner<'a>(meta: &'a BTreeMap<String, String>, cluster: &str) -> Option<&'a str> {
    if meta.get(IP_CLUSTER).map(String::as_str) != Some(cluster) {
        return None;
    }
    meta.get(IP_SERVICE).map(String::as_str).filter(|s| !s.is_empty())
}

/// Whether an IP carries any binding tag at all (any cluster)
#[must_use]
pub fn ip_is_tagged(meta: &BTreeMap<String, String>) -> bool {
    meta.get(IP_SERVICE).is_some_and(|s| !s.is_empty())
}

/// `meta` with the binding tags removed; other keys are kept
#[must_use]
pub fn without_ip_tags(meta: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut meta = meta.clone();
    meta.remove(IP_CLUSTER);
    meta.remove(IP_SERVICE);
    meta.remove(MANAGED_BY);
    meta
}

/// Find the server created for a machine.
///
/// Matches on the machine UID; the name must agree as well so a recreated
/// machine with the same name never adopts its predecessor's server.
pub async fn find_owned_server<C: CloudClientTrait + ?Sized>(
    client: &C,
    name: &str,
    uid: &str,
) -> Result<Option<Server>, CloudError> {
    let servers = client.list_servers().await?;
    Ok(servers.into_iter().find(|server| {
        is_owned_by_machine(&server.meta, uid)
            && server.meta.get(MACHINE_NAME).is_some_and(|n| n == name)
    }))
}

/// Drives created for a machine (boot clones and blank data disks)
pub async fn find_owned_drives<C: CloudClientTrait + ?Sized>(
    client: &C,
    uid: &str,
) -> Result<Vec<Drive>, CloudError> {
    let drives = client.list_drives().await?;
    Ok(drives
        .into_iter()
        .filter(|drive| is_owned_by_machine(&drive.meta, uid))
        .collect())
}
