//! Startup recovery, periodic discovery and the orphan sweep.

use super::{Reconciler, ingress_ip, is_managed};
use crate::binding::ServiceBinding;
use crate::error::ControllerError;
use crate::forwarding::unit_name;
use crate::nodes::{node_for_server, server_uuid};
use crate::pool::{PoolStats, pool_stats};
use controller_common::store::{is_deleting, object_key};
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Outcome of [`Reconciler::recover`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Bindings rebuilt from Service status and tags
    pub rebuilt: usize,
    /// Services reconciled successfully afterwards
    pub reasserted: usize,
    /// Orphaned addresses released
    pub released: usize,
}

impl Reconciler {
    /// Rebuild the binding registry from what the cluster and the cloud
    /// record, then re-assert every Service.
    ///
    /// A binding is rebuilt only when the Service's ingress address carries
    /// tags naming that Service; its node is the one running the address's
    /// forwarding unit, else the one whose server the address is attached
    /// to. Nothing is allocated here.
    pub async fn recover(&self) -> Result<RecoveryReport, ControllerError> {
        info!("Recovering floating IP bindings...");

        let ips = self.client.list_ips().await?;
        let services = self.services.list().await?;
        let nodes = self.nodes.list().await?;
        let units = self.forwarder.list().await?;

        let mut report = RecoveryReport::default();
        let live: Vec<_> = services.iter().filter(|s| is_managed(s) && !is_deleting(*s)).collect();

        for service in &live {
            let key = object_key(*service);
            let Some(address) = ingress_ip(service) else {
                continue;
            };
            let Some(ip) = ips.iter().find(|ip| ip.address() == address) else {
                warn!("Service {} reports {} which is not in the account", key, address);
                continue;
            };
            if self.allocator.owner(ip) != Some(key.as_str()) {
                warn!("Service {} reports {} but its tags disagree", key, address);
                continue;
            }

            let node = units
                .iter()
                .find(|u| u.service == key && u.name == unit_name(&address, &u.node))
                .map(|u| u.node.clone())
                .or_else(|| {
                    ip.attached_server()
                        .and_then(|uuid| node_for_server(&nodes, uuid))
                        .map(|n| n.name_any())
                });
            let Some(node) = node else {
                debug!("Service {} holds {} on no known node", key, address);
                continue;
            };
            let server = nodes
                .iter()
                .find(|n| n.name_any() == node)
                .and_then(|n| server_uuid(n))
                .or(ip.attached_server())
                .unwrap_or_default()
                .to_string();

            self.bindings.insert(ServiceBinding {
                service: key.clone(),
                unit: unit_name(&address, &node),
                address,
                node,
                server_uuid: server,
            })?;
            report.rebuilt += 1;
        }
        self.update_bound_gauge();
        info!("Rebuilt {} binding(s) from {} LoadBalancer Service(s)", report.rebuilt, live.len());

        for service in live {
            match self.reconcile_service(service).await {
                Ok(_) => report.reasserted += 1,
                Err(e) => warn!("Could not re-assert Service {}: {}", object_key(service), e),
            }
        }

        report.released = self.collect_garbage().await?;
        info!(
            "Recovery complete: {} rebuilt, {} re-asserted, {} released",
            report.rebuilt, report.reasserted, report.released
        );
        Ok(report)
    }

    /// Release addresses and units whose Service is gone.
    ///
    /// Tags are read before the Service list, so a Service claiming an
    /// address during the sweep is always seen as live.
    pub async fn collect_garbage(&self) -> Result<usize, ControllerError> {
        let owned = self.allocator.owned(self.client.as_ref()).await?;
        let live: BTreeSet<String> = self
            .services
            .list()
            .await?
            .iter()
            .filter(|s| is_managed(s) || is_deleting(*s))
            .map(object_key)
            .collect();

        let mut released = 0;
        for (address, service) in owned {
            if live.contains(&service) {
                continue;
            }
            warn!("{} is tagged for {} which no longer exists, releasing", address, service);
            self.release_address(&service, &address).await?;
            released += 1;
        }

        for unit in self.forwarder.list().await? {
            if !live.contains(&unit.service) {
                warn!("Removing forwarding unit {} of vanished Service {}", unit.name, unit.service);
                self.forwarder.remove(&unit.name).await?;
            }
        }

        for binding in self.bindings.all() {
            if !live.contains(&binding.service) {
                self.bindings.remove(&binding.service);
            }
        }
        self.update_bound_gauge();
        self.backoff.retain(|key| live.contains(key));
        Ok(released)
    }

    /// Refresh the pool view and sweep orphans
    pub async fn discover(&self) -> Result<PoolStats, ControllerError> {
        let ips = self.client.list_ips().await?;
        let stats = pool_stats(&ips, self.allocator.cluster());
        info!(
            "Floating IP pools: static {}/{} free, dynamic {}/{} free, {} held by cluster {}",
            stats.static_free,
            stats.static_total,
            stats.dynamic_free,
            stats.dynamic_total,
            stats.owned,
            self.allocator.cluster()
        );
        let released = self.collect_garbage().await?;
        if released > 0 {
            info!("Discovery released {} orphaned address(es)", released);
        }
        Ok(stats)
    }
}
