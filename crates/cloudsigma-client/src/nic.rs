//! Floating IP attachment
//!
//! Attaching an address to a server means adding a NIC whose
//! `ip_v4_conf` is statically bound to that address. The API has no
//! per-NIC endpoint, so the whole server definition is read, modified and
//! written back while holding the server's lock.

use crate::cloud_trait::CloudClientTrait;
use crate::error::CloudError;
use crate::lock::KeyedLocks;
use crate::models::{IpConfMode, IpV4Conf, ResourceRef, Server, ServerNic};
use crate::update::ServerUpdate;
use tracing::{debug, info};

/// NIC description statically bound to `address`
#[must_use]
pub fn static_ip_nic(address: &str) -> ServerNic {
    ServerNic {
        model: Some("virtio".to_string()),
        ip_v4_conf: Some(IpV4Conf {
            conf: IpConfMode::Static,
            ip: Some(ResourceRef::new(address)),
        }),
        ..ServerNic::default()
    }
}

/// Whether any of the server's interfaces is bound to `address`
#[must_use]
pub fn server_has_ip(server: &Server, address: &str) -> bool {
    ServerUpdate::from(server).nic_for_ip(address).is_some()
}

/// Attach `address` to server `server_uuid`.
///
/// Existing interfaces are kept in place and the new one is appended.
/// Returns the server unchanged when the address is already attached.
pub async fn attach_ip<C: CloudClientTrait + ?Sized>(
    client: &C,
    locks: &KeyedLocks,
    server_uuid: &str,
    address: &str,
) -> Result<Server, CloudError> {
    let _guard = locks.lock(server_uuid).await;

    let server = client.get_server(server_uuid).await?;
    let mut update = ServerUpdate::from(&server);
    if update.nic_for_ip(address).is_some() {
        debug!("{} already attached to server {}", address, server_uuid);
        return Ok(server);
    }

    update.nics.push(static_ip_nic(address));
    let updated = client.update_server(server_uuid, &update).await?;
    info!("Attached {} to server {}", address, server_uuid);
    Ok(updated)
}

/// Detach `address` from server `server_uuid`.
///
/// A missing server or an interface that is already gone both count as
/// detached.
pub async fn detach_ip<C: CloudClientTrait + ?Sized>(
    client: &C,
    locks: &KeyedLocks,
    server_uuid: &str,
    address: &str,
) -> Result<(), CloudError> {
    let _guard = locks.lock(server_uuid).await;

    let server = match client.get_server(server_uuid).await {
        Ok(server) => server,
        Err(e) if e.is_not_found() => {
            debug!("Server {} gone, nothing to detach", server_uuid);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut update = ServerUpdate::from(&server);
    let Some(index) = update.nic_for_ip(address) else {
        debug!("{} not attached to server {}", address, server_uuid);
        return Ok(());
    };

    update.nics.remove(index);
    client.update_server(server_uuid, &update).await?;
    info!("Detached {} from server {}", address, server_uuid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCloudClient, fixture_server};
    use crate::models::ServerNic;

    fn setup() -> (MockCloudClient, KeyedLocks) {
        let client = MockCloudClient::new("zrh");
        let mut server = fixture_server("srv-1", "node-a");
        server.nics.push(ServerNic {
            model: Some("virtio".to_string()),
            mac: Some("22:aa:bb:cc:dd:ee".to_string()),
            ip_v4_conf: Some(IpV4Conf { conf: IpConfMode::Dhcp, ip: None }),
            ..ServerNic::default()
        });
        server.extra.insert("owner".to_string(), serde_json::json!({"uuid": "acct"}));
        server.extra.insert("smp".to_string(), serde_json::json!(2));
        client.add_server(server);
        client.add_ip("203.0.113.10", true);
        (client, KeyedLocks::new())
    }

    #[tokio::test]
    async fn test_attach_appends_and_preserves_existing_nics() {
        let (client, locks) = setup();

        let updated = attach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();

        assert_eq!(updated.nics.len(), 2);
        assert_eq!(updated.nics[0].mac.as_deref(), Some("22:aa:bb:cc:dd:ee"));
        assert!(server_has_ip(&updated, "203.0.113.10"));
        assert_eq!(updated.extra.get("smp"), Some(&serde_json::json!(2)));
        assert_eq!(client.ip("203.0.113.10").unwrap().attached_server(), Some("srv-1"));
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (client, locks) = setup();

        attach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();
        attach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();

        assert_eq!(client.server("srv-1").unwrap().nics.len(), 2);
        assert_eq!(client.calls("update_server"), 1);
    }

    #[tokio::test]
    async fn test_detach_removes_only_matching_nic() {
        let (client, locks) = setup();
        attach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();

        detach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();
        detach_ip(&client, &locks, "srv-1", "203.0.113.10").await.unwrap();

        let server = client.server("srv-1").unwrap();
        assert_eq!(server.nics.len(), 1);
        assert!(!server_has_ip(&server, "203.0.113.10"));
        assert_eq!(client.ip("203.0.113.10").unwrap().attached_server(), None);
    }

    #[tokio::test]
    async fn test_detach_from_missing_server_is_ok() {
        let (client, locks) = setup();
        detach_ip(&client, &locks, "gone", "203.0.113.10").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_attaches_to_one_server_do_not_clobber() {
        let (client, locks) = setup();
        client.add_ip("203.0.113.11", true);

        let (a, b) = tokio::join!(
            attach_ip(&client, &locks, "srv-1", "203.0.113.10"),
            attach_ip(&client, &locks, "srv-1", "203.0.113.11"),
        );
        a.unwrap();
        b.unwrap();

        let server = client.server("srv-1").unwrap();
        assert_eq!(server.nics.len(), 3);
        assert!(server_has_ip(&server, "203.0.113.10"));
        assert!(server_has_ip(&server, "203.0.113.11"));
    }
}
