//! Binding a Service to a floating IP.
//!
//! Claim (or re-confirm) the address, place it on a healthy node, attach it
//! to that node's server, then make the forwarding unit match. Every step
//! is idempotent, so a periodic resync re-asserts the whole chain.

use super::{AllocationCondition, Ingress, REASON_INVALID, REASON_NO_HEALTHY_NODE, REASON_POOL_EXHAUSTED, Reconciler};
use super::{backend, forwarded_port, ingress_ip};
use crate::binding::ServiceBinding;
use crate::error::ControllerError;
use crate::forwarding::ForwardingSpec;
use crate::pool::PoolKind;
use controller_common::store::object_key;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

impl Reconciler {
    pub(crate) async fn bind_service(&self, service: &Service) -> Result<Action, ControllerError> {
        let key = object_key(service);

        let (protocol, port) = match forwarded_port(service) {
            Ok(port) => port,
            Err(e) => return Err(self.report_failure(service, REASON_INVALID, e).await),
        };
        let pool = match PoolKind::from_annotations(service.annotations()) {
            Ok(pool) => pool,
            Err(e) => return Err(self.report_failure(service, REASON_INVALID, e).await),
        };

        let address = match self.ensure_address(service, &key, pool).await {
            Ok(address) => address,
            Err(e @ ControllerError::PoolExhausted(_)) => {
                warn!("No {} address available for Service {}", pool, key);
                return Err(self.report_failure(service, REASON_POOL_EXHAUSTED, e).await);
            }
            Err(e) => return Err(e),
        };

        let ip = self.client.get_ip(&address).await?;
        let nodes = self.nodes.list().await?;
        let previous = self.bindings.get(&key);
        let Some(target) = self.place(&key, previous.as_ref(), ip.attached_server(), &nodes) else {
            let e = ControllerError::NoHealthyNode(format!("no node can host {address} for {key}"));
            return Err(self.report_failure(service, REASON_NO_HEALTHY_NODE, e).await);
        };
        self.move_address(&ip, &target).await?;

        let endpoints = self.endpoints.get(service.namespace().as_deref(), &service.name_any()).await?;
        let Some((target_ip, target_port)) = backend(service, &port, endpoints.as_ref()) else {
            let e = ControllerError::InvalidResource(format!("{key} has no ready endpoint and no cluster IP"));
            return Err(self.report_failure(service, REASON_INVALID, e).await);
        };
        let spec = ForwardingSpec {
            address: address.clone(),
            node: target.name.clone(),
            protocol,
            port: u16::try_from(port.port)
                .map_err(|_| ControllerError::InvalidResource(format!("{key}: port {} out of range", port.port)))?,
            target_ip,
            target_port,
        };
        self.forwarder.ensure(&spec, &key).await?;
        self.remove_stale_units(&key, &spec.unit_name()).await?;

        self.bindings.insert(ServiceBinding {
            service: key.clone(),
            address: address.clone(),
            node: target.name.clone(),
            server_uuid: target.server_uuid.clone(),
            unit: spec.unit_name(),
        })?;
        self.update_bound_gauge();
        match previous {
            Some(previous) if previous.node != target.name => {
                info!("Service {} failed over: {} moved from {} to {}", key, address, previous.node, target.name);
            }
            Some(_) => debug!("Service {} still bound to {} on {}", key, address, target.name),
            None => info!("Service {} bound to {} on node {}", key, address, target.name),
        }

        self.update_service_status(service, Ingress::Set(address.clone()), AllocationCondition::bound(&address, &target.name))
            .await?;
        Ok(Action::requeue(self.settings.resync_interval))
    }

    /// The Service's address: the one it is bound to or reports, as long as
    /// the tags agree, else a fresh claim from `pool`
    async fn ensure_address(&self, service: &Service, key: &str, pool: PoolKind) -> Result<String, ControllerError> {
        let recorded = self
            .bindings
            .get(key)
            .map(|b| b.address)
            .or_else(|| ingress_ip(service));
        if let Some(recorded) = recorded {
            if self.allocator.reclaim(self.client.as_ref(), &recorded, key).await? {
                return Ok(recorded);
            }
            warn!("Service {} reports {} but the address is not its own, allocating anew", key, recorded);
            self.bindings.remove(key);
        }
        self.allocator.allocate(self.client.as_ref(), key, pool).await
    }

    /// Remove units of `key` other than `keep`
    pub(crate) async fn remove_stale_units(&self, key: &str, keep: &str) -> Result<(), ControllerError> {
        for unit in self.forwarder.list().await? {
            if unit.service == key && unit.name != keep {
                info!("Removing stale forwarding unit {} of {} on {}", unit.name, key, unit.node);
                self.forwarder.remove(&unit.name).await?;
            }
        }
        Ok(())
    }
}
