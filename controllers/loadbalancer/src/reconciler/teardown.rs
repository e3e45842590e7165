//! Releasing a Service's floating IP.

use super::Reconciler;
use crate::error::ControllerError;
use cloudsigma_client::nic::detach_ip;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Reconciler {
    /// Detach, untag and unforward every address held for `key`.
    ///
    /// Addresses are gathered from the registry, the Service's recorded
    /// ingress and the tags, so a teardown after a restart finds the same
    /// set. Safe to repeat.
    pub(crate) async fn teardown_service(&self, key: &str, recorded: Option<String>) -> Result<(), ControllerError> {
        let _gate = self.teardown_gate.read().await;

        let mut addresses = BTreeSet::new();
        if let Some(binding) = self.bindings.get(key) {
            addresses.insert(binding.address);
        }
        addresses.extend(recorded);
        for (address, owner) in self.allocator.owned(self.client.as_ref()).await? {
            if owner == key {
                addresses.insert(address);
            }
        }

        for address in &addresses {
            self.release_address(key, address).await?;
        }
        for unit in self.forwarder.list().await? {
            if unit.service == key {
                self.forwarder.remove(&unit.name).await?;
            }
        }

        if self.bindings.remove(key).is_some() {
            self.update_bound_gauge();
        }
        info!("Released {} address(es) of {}", addresses.len(), key);
        Ok(())
    }

    /// Detach and untag `address` if its tags name `key`
    pub(crate) async fn release_address(&self, key: &str, address: &str) -> Result<(), ControllerError> {
        let ip = match self.client.get_ip(address).await {
            Ok(ip) => ip,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.allocator.owner(&ip) != Some(key) {
            debug!("{} is not tagged for {}, leaving it alone", address, key);
            return Ok(());
        }
        if let Some(server) = ip.attached_server() {
            detach_ip(self.client.as_ref(), &self.server_locks, server, address).await?;
        }
        self.allocator.release(self.client.as_ref(), address, key).await?;
        Ok(())
    }

    /// Shutdown drain: wait for in-flight teardowns, then untag every
    /// address whose Service no longer exists.
    ///
    /// Callers bound this with the shutdown grace period.
    pub async fn drain(&self) -> Result<usize, ControllerError> {
        let _gate = self.teardown_gate.write().await;
        info!("Draining floating IP claims before exit");
        let released = self.collect_garbage().await?;
        info!("Drain complete: {} orphaned address(es) released", released);
        Ok(released)
    }
}
