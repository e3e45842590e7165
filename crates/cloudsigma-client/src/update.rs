//! Full-object server updates
//!
//! CloudSigma's `PUT /servers/{uuid}/` replaces the whole server definition.
//! `ServerUpdate` is the typed body for that call: the fields controllers may
//! change are explicit, every other field the server returned is carried in
//! `extra` unchanged, and server-assigned fields are stripped.

use crate::models::{ResourceRef, Server, ServerDrive, ServerNic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server-assigned fields rejected (or silently misapplied) when sent back
pub const READ_ONLY_SERVER_FIELDS: &[&str] = &[
    "uuid",
    "status",
    "owner",
    "permissions",
    "grantees",
    "runtime",
    "resource_uri",
    "mounted_on",
    "requirements",
];

/// Body of a full-object server update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerUpdate {
    /// Display name
    pub name: String,
    /// CPU in MHz
    pub cpu: u32,
    /// Memory in bytes
    pub mem: u64,
    /// VNC password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_password: Option<String>,
    /// Network interfaces, positional
    pub nics: Vec<ServerNic>,
    /// Attached drives
    pub drives: Vec<ServerDrive>,
    /// Free-form metadata
    pub meta: BTreeMap<String, String>,
    /// Tag references
    pub tags: Vec<ResourceRef>,
    /// Everything else the server returned, minus read-only fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl From<&Server> for ServerUpdate {
    fn from(server: &Server) -> Self {
        let mut extra = server.extra.clone();
        for field in READ_ONLY_SERVER_FIELDS {
            extra.remove(*field);
        }

        let mut nics = server.nics.clone();
        for nic in &mut nics {
            for field in READ_ONLY_SERVER_FIELDS {
                nic.extra.remove(*field);
            }
        }

        let mut drives = server.drives.clone();
        for drive in &mut drives {
            for field in READ_ONLY_SERVER_FIELDS {
                drive.extra.remove(*field);
            }
        }

        Self {
            name: server.name.clone(),
            cpu: server.cpu,
            mem: server.mem,
            vnc_password: server.vnc_password.clone(),
            nics,
            drives,
            meta: server.meta.clone(),
            tags: server.tags.clone(),
            extra,
        }
    }
}

impl ServerUpdate {
    /// Position of the interface statically bound to `address`, if any
    #[must_use]
    pub fn nic_for_ip(&self, address: &str) -> Option<usize> {
        self.nics.iter().position(|nic| {
            nic.ip_v4_conf
                .as_ref()
                .and_then(|conf| conf.ip.as_ref())
                .is_some_and(|ip| ip.uuid == address)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server_from_api() -> Server {
        serde_json::from_value(json!({
            "uuid": "4b8e5a3c",
            "name": "worker-1",
            "status": "running",
            "cpu": 2000,
            "mem": 4294967296u64,
            "vnc_password": "secret",
            "owner": {"uuid": "owner-1", "resource_uri": "/api/2.0/accounts/owner-1/"},
            "permissions": [],
            "grantees": [],
            "runtime": {"active_since": "2024-01-01T00:00:00+00:00"},
            "resource_uri": "/api/2.0/servers/4b8e5a3c/",
            "cpus_instead_of_cores": false,
            "smp": 1,
            "nics": [{
                "model": "virtio",
                "mac": "22:aa:bb:cc:dd:ee",
                "ip_v4_conf": {"conf": "dhcp", "ip": null},
                "runtime": {"ip_v4": {"uuid": "185.12.5.10", "resource_uri": "/api/2.0/ips/185.12.5.10/"}, "interface_type": "public"},
                "firewall_policy": null
            }],
            "drives": [{
                "boot_order": 1,
                "dev_channel": "0:0",
                "device": "virtio",
                "drive": {
                    "uuid": "d-1",
                    "resource_uri": "/api/2.0/drives/d-1/",
                    "mounted_on": [{"uuid": "4b8e5a3c"}]
                },
                "runtime": {"io": 1}
            }],
            "meta": {"machine-uid": "u-1"},
            "tags": []
        }))
        .expect("valid server json")
    }

    #[test]
    fn test_update_strips_server_assigned_fields() {
        let update = ServerUpdate::from(&server_from_api());
        let body = serde_json::to_value(&update).expect("serializable");

        for field in ["uuid", "status", "owner", "permissions", "grantees", "runtime", "resource_uri"] {
            assert!(body.get(field).is_none(), "{field} must be stripped");
        }
        assert!(body["nics"][0].get("runtime").is_none());
        assert!(body["drives"][0].get("runtime").is_none());
        assert_eq!(body["drives"][0]["drive"], json!("d-1"));
    }

    #[test]
    fn test_update_round_trips_unknown_fields() {
        let update = ServerUpdate::from(&server_from_api());
        let body = serde_json::to_value(&update).expect("serializable");

        assert_eq!(body["cpus_instead_of_cores"], json!(false));
        assert_eq!(body["smp"], json!(1));
        assert_eq!(body["nics"][0]["mac"], json!("22:aa:bb:cc:dd:ee"));
        assert!(body["nics"][0].get("firewall_policy").is_some());
        assert_eq!(body["meta"]["machine-uid"], json!("u-1"));
    }

    #[test]
    fn test_nic_for_ip_finds_static_binding() {
        let mut update = ServerUpdate::from(&server_from_api());
        assert_eq!(update.nic_for_ip("185.12.5.20"), None);

        update.nics.push(ServerNic {
            model: Some("virtio".to_string()),
            ip_v4_conf: Some(crate::models::IpV4Conf {
                conf: crate::models::IpConfMode::Static,
                ip: Some(ResourceRef::new("185.12.5.20")),
            }),
            ..Default::default()
        });
        assert_eq!(update.nic_for_ip("185.12.5.20"), Some(1));
    }
}
