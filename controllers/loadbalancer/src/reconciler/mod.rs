//! Reconciliation of LoadBalancer Services.
//!
//! - `bind`: claim an address, place it on a node, attach it and forward it
//! - `failover`: node choice and moving an address between servers
//! - `teardown`: release on deletion, and the shutdown drain
//! - `recovery`: rebuilding bindings at startup, discovery and orphan sweep

pub mod bind;
pub mod failover;
pub mod recovery;
#[cfg(test)]
mod recovery_test;
pub mod teardown;

use crate::binding::BindingRegistry;
use crate::error::ControllerError;
use crate::forwarding::{Forwarder, Protocol};
use crate::pool::IpAllocator;
use cloudsigma_client::{CloudClientTrait, KeyedLocks};
use controller_common::store::{add_finalizer, has_finalizer, is_deleting, object_key, remove_finalizer};
use controller_common::{BackoffRegistry, Metrics, RecordStore, StoreError};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service, ServicePort};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Finalizer on every Service holding a floating IP
pub const SERVICE_FINALIZER: &str = "cloudsigma.com/floating-ip";
/// `spec.loadBalancerClass` this controller answers to (besides none)
pub const LOAD_BALANCER_CLASS: &str = "cloudsigma.com/floating-ip";
/// Condition reporting the allocation outcome
pub const CONDITION_ALLOCATED: &str = "FloatingIPAllocated";

pub const REASON_BOUND: &str = "Bound";
pub const REASON_POOL_EXHAUSTED: &str = "PoolExhausted";
pub const REASON_NO_HEALTHY_NODE: &str = "NoHealthyNode";
pub const REASON_INVALID: &str = "InvalidService";

/// Bound on re-fetch-and-retry rounds for one status write
pub const MAX_STATUS_RETRIES: usize = 5;

/// Timing knobs of the reconciler
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Requeue interval for bound Services; also caps error backoff
    pub resync_interval: Duration,
}

/// Reconciles LoadBalancer Services against the CloudSigma IP pools.
pub struct Reconciler {
    pub(crate) client: Arc<dyn CloudClientTrait>,
    pub(crate) services: Arc<dyn RecordStore<Service>>,
    pub(crate) nodes: Arc<dyn RecordStore<Node>>,
    pub(crate) endpoints: Arc<dyn RecordStore<Endpoints>>,
    pub(crate) forwarder: Arc<dyn Forwarder>,
    pub(crate) allocator: IpAllocator,
    pub(crate) bindings: BindingRegistry,
    /// Serializes full-object server updates (keyed by server uuid)
    pub(crate) server_locks: KeyedLocks,
    /// Serializes reconciles of one Service (keyed by `namespace/name`)
    pub(crate) service_locks: KeyedLocks,
    /// Teardowns hold it shared; the shutdown drain takes it exclusively
    pub(crate) teardown_gate: RwLock<()>,
    pub(crate) backoff: BackoffRegistry,
    pub(crate) metrics: Metrics,
    pub(crate) settings: ReconcileSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cluster", &self.allocator.cluster())
            .field("bindings", &self.bindings.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// How a status write treats `status.loadBalancer.ingress`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ingress {
    Keep,
    Set(String),
    Clear,
}

/// How a status write treats the allocation condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AllocationCondition {
    Set { ok: bool, reason: &'static str, message: String },
    Remove,
}

impl AllocationCondition {
    pub(crate) fn bound(address: &str, node: &str) -> Self {
        Self::Set {
            ok: true,
            reason: REASON_BOUND,
            message: format!("{address} is served from node {node}"),
        }
    }

    pub(crate) fn failed(reason: &'static str, error: &ControllerError) -> Self {
        Self::Set {
            ok: false,
            reason,
            message: error.to_string(),
        }
    }
}

/// Whether this controller serves the Service
pub fn is_managed(service: &Service) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    spec.type_.as_deref() == Some("LoadBalancer")
        && spec.load_balancer_class.as_deref().is_none_or(|class| class == LOAD_BALANCER_CLASS)
}

/// Address recorded in `status.loadBalancer.ingress`
pub fn ingress_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone())
}

/// First declared port; the only one that is forwarded
pub fn forwarded_port(service: &Service) -> Result<(Protocol, ServicePort), ControllerError> {
    let key = object_key(service);
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .ok_or_else(|| ControllerError::InvalidResource(format!("{key} declares no ports")))?;
    let protocol = Protocol::from_service(port.protocol.as_deref()).ok_or_else(|| {
        ControllerError::InvalidResource(format!(
            "{key}: protocol {} cannot be forwarded",
            port.protocol.as_deref().unwrap_or_default()
        ))
    })?;
    Ok((protocol, port.clone()))
}

/// Backend for the forwarded port: the first ready endpoint, else the
/// cluster IP
pub fn backend(service: &Service, port: &ServicePort, endpoints: Option<&Endpoints>) -> Option<(String, u16)> {
    let subsets = endpoints.and_then(|e| e.subsets.as_ref()).into_iter().flatten();
    for subset in subsets {
        let Some(address) = subset.addresses.as_ref().and_then(|a| a.first()) else {
            continue;
        };
        let ports = subset.ports.as_deref().unwrap_or_default();
        let matched = ports
            .iter()
            .find(|p| p.name.is_some() && p.name == port.name)
            .or_else(|| ports.first());
        if let Some(target_port) = matched.and_then(|p| u16::try_from(p.port).ok()) {
            return Some((address.ip.clone(), target_port));
        }
    }

    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")?;
    Some((cluster_ip.to_string(), u16::try_from(port.port).ok()?))
}

/// Merge-patch body for the allocation condition, or `None` when the
/// current conditions already say the same
fn merged_conditions(current: &Service, change: &AllocationCondition) -> Result<Option<Value>, serde_json::Error> {
    let existing = current.status.as_ref().and_then(|s| s.conditions.as_ref());
    let mut conditions = match existing {
        Some(conditions) => match serde_json::to_value(conditions)? {
            Value::Array(items) => items,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    let index = conditions.iter().position(|c| c["type"] == CONDITION_ALLOCATED);

    match change {
        AllocationCondition::Remove => match index {
            Some(i) => {
                conditions.remove(i);
                Ok(Some(Value::Array(conditions)))
            }
            None => Ok(None),
        },
        AllocationCondition::Set { ok, reason, message } => {
            let status = if *ok { "True" } else { "False" };
            let previous = index.map(|i| &conditions[i]);
            if previous.is_some_and(|c| c["status"] == status && c["reason"] == *reason && c["message"] == *message) {
                return Ok(None);
            }
            // The transition time only moves when the status flips
            let transitioned = previous
                .filter(|c| c["status"] == status)
                .and_then(|c| c["lastTransitionTime"].as_str().map(str::to_string))
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

            let mut condition = json!({
                "type": CONDITION_ALLOCATED,
                "status": status,
                "reason": reason,
                "message": message,
                "lastTransitionTime": transitioned,
            });
            if let Some(generation) = current.metadata.generation {
                condition["observedGeneration"] = json!(generation);
            }
            match index {
                Some(i) => conditions[i] = condition,
                None => conditions.push(condition),
            }
            Ok(Some(Value::Array(conditions)))
        }
    }
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn CloudClientTrait>,
        services: Arc<dyn RecordStore<Service>>,
        nodes: Arc<dyn RecordStore<Node>>,
        endpoints: Arc<dyn RecordStore<Endpoints>>,
        forwarder: Arc<dyn Forwarder>,
        cluster: &str,
        metrics: Metrics,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            client,
            services,
            nodes,
            endpoints,
            forwarder,
            allocator: IpAllocator::new(cluster),
            bindings: BindingRegistry::new(),
            server_locks: KeyedLocks::new(),
            service_locks: KeyedLocks::new(),
            teardown_gate: RwLock::new(()),
            backoff: BackoffRegistry::new(Duration::from_secs(5), settings.resync_interval),
            metrics,
            settings,
        }
    }

    pub(crate) fn update_bound_gauge(&self) {
        self.metrics.bound_services.set(i64::try_from(self.bindings.len()).unwrap_or(i64::MAX));
    }

    /// Reconcile one Service, counting the outcome.
    pub async fn reconcile_service(&self, service: &Service) -> Result<Action, ControllerError> {
        let result = self.reconcile_service_locked(service).await;
        match &result {
            Ok(_) => self.metrics.reconciled("loadbalancer", "ok"),
            Err(e) => {
                self.metrics.reconciled("loadbalancer", "error");
                if let Some(cloud) = e.cloud() {
                    self.metrics.cloud_error(cloud.kind());
                }
            }
        }
        result
    }

    async fn reconcile_service_locked(&self, service: &Service) -> Result<Action, ControllerError> {
        let key = object_key(service);
        let _guard = self.service_locks.lock(&key).await;

        let namespace = service.namespace();
        let Some(service) = self.services.get(namespace.as_deref(), &service.name_any()).await? else {
            if self.bindings.get(&key).is_some() {
                info!("Service {} vanished, releasing its floating IP", key);
                self.teardown_service(&key, None).await?;
            }
            return Ok(Action::await_change());
        };

        if is_deleting(&service) {
            if has_finalizer(&service, SERVICE_FINALIZER) {
                self.teardown_service(&key, ingress_ip(&service)).await?;
                remove_finalizer(self.services.as_ref(), &service, SERVICE_FINALIZER).await?;
                info!("Service {} deleted, floating IP released", key);
            }
            return Ok(Action::await_change());
        }

        if !is_managed(&service) {
            if has_finalizer(&service, SERVICE_FINALIZER) || self.bindings.get(&key).is_some() {
                info!("Service {} is no longer served here, releasing its floating IP", key);
                self.teardown_service(&key, ingress_ip(&service)).await?;
                let current = self
                    .update_service_status(&service, Ingress::Clear, AllocationCondition::Remove)
                    .await?;
                if let Some(current) = current {
                    remove_finalizer(self.services.as_ref(), &current, SERVICE_FINALIZER).await?;
                }
            } else {
                debug!("Ignoring Service {}", key);
            }
            return Ok(Action::await_change());
        }

        // Deletion must always find the finalizer once an address may be claimed
        let service = add_finalizer(self.services.as_ref(), &service, SERVICE_FINALIZER).await?;
        self.bind_service(&service).await
    }

    /// Re-read the Service and write ingress and condition changes,
    /// retrying on version conflicts.
    ///
    /// Nothing is written when both already match. Returns the stored
    /// Service, or `None` if it is gone.
    pub(crate) async fn update_service_status(
        &self,
        service: &Service,
        ingress: Ingress,
        condition: AllocationCondition,
    ) -> Result<Option<Service>, ControllerError> {
        let namespace = service.namespace();
        let name = service.name_any();
        let key = object_key(service);

        for attempt in 1..=MAX_STATUS_RETRIES {
            let Some(current) = self.services.get(namespace.as_deref(), &name).await? else {
                return Ok(None);
            };

            let mut status = Map::new();
            let recorded = current
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .filter(|i| !i.is_empty());
            match &ingress {
                Ingress::Set(address) if ingress_ip(&current).as_deref() != Some(address.as_str()) => {
                    status.insert("loadBalancer".to_string(), json!({ "ingress": [{ "ip": address }] }));
                }
                Ingress::Clear if recorded.is_some() => {
                    status.insert("loadBalancer".to_string(), json!({ "ingress": null }));
                }
                _ => {}
            }
            if let Some(conditions) = merged_conditions(&current, &condition)? {
                status.insert("conditions".to_string(), conditions);
            }
            if status.is_empty() {
                return Ok(Some(current));
            }

            let patch = json!({
                "metadata": { "resourceVersion": current.resource_version() },
                "status": status,
            });
            match self.services.patch_status(namespace.as_deref(), &name, &patch).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::Conflict(_)) => {
                    warn!("Status write conflict for Service {} (attempt {}/{})", key, attempt, MAX_STATUS_RETRIES);
                }
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::Conflict(key))
    }

    /// Record a failed bind on the Service and hand the error back
    pub(crate) async fn report_failure(
        &self,
        service: &Service,
        reason: &'static str,
        error: ControllerError,
    ) -> ControllerError {
        let condition = AllocationCondition::failed(reason, &error);
        if let Err(e) = self.update_service_status(service, Ingress::Keep, condition).await {
            warn!("Failed to record {} on Service {}: {}", reason, object_key(service), e);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_endpoints, create_test_service};

    #[test]
    fn test_managed_services() {
        let service = create_test_service("web", 80);
        assert!(is_managed(&service));

        let mut cluster_ip = service.clone();
        cluster_ip.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert!(!is_managed(&cluster_ip));

        let mut foreign = service.clone();
        foreign.spec.as_mut().unwrap().load_balancer_class = Some("io.cilium/l2".to_string());
        assert!(!is_managed(&foreign));
    }

    #[test]
    fn test_backend_prefers_ready_endpoint() {
        let service = create_test_service("web", 80);
        let (_, port) = forwarded_port(&service).unwrap();

        let endpoints = create_test_endpoints("web", &["10.244.1.7", "10.244.2.9"], 8080);
        assert_eq!(backend(&service, &port, Some(&endpoints)), Some(("10.244.1.7".to_string(), 8080)));

        let empty = create_test_endpoints("web", &[], 8080);
        assert_eq!(backend(&service, &port, Some(&empty)), Some(("10.96.0.10".to_string(), 80)));
        assert_eq!(backend(&service, &port, None), Some(("10.96.0.10".to_string(), 80)));

        let mut headless = service.clone();
        headless.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        assert_eq!(backend(&headless, &port, None), None);
    }

    #[test]
    fn test_only_tcp_and_udp_are_forwarded() {
        let mut service = create_test_service("web", 80);
        assert_eq!(forwarded_port(&service).unwrap().0, Protocol::Tcp);

        service.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].protocol = Some("SCTP".to_string());
        assert!(matches!(forwarded_port(&service), Err(ControllerError::InvalidResource(_))));

        service.spec.as_mut().unwrap().ports = Some(vec![]);
        assert!(matches!(forwarded_port(&service), Err(ControllerError::InvalidResource(_))));
    }

    #[test]
    fn test_condition_transition_time_only_moves_on_flip() {
        let mut service = create_test_service("web", 80);
        let failed = AllocationCondition::failed(REASON_POOL_EXHAUSTED, &ControllerError::PoolExhausted("x".into()));

        let first = merged_conditions(&service, &failed).unwrap().unwrap();
        assert_eq!(first[0]["status"], "False");

        service.status = Some(serde_json::from_value(json!({ "conditions": first.clone() })).unwrap());
        assert_eq!(merged_conditions(&service, &failed).unwrap(), None);

        let other = AllocationCondition::failed(REASON_POOL_EXHAUSTED, &ControllerError::PoolExhausted("y".into()));
        let updated = merged_conditions(&service, &other).unwrap().unwrap();
        assert_eq!(updated[0]["lastTransitionTime"], first[0]["lastTransitionTime"]);

        let removed = merged_conditions(&service, &AllocationCondition::Remove).unwrap().unwrap();
        assert_eq!(removed, json!([]));
    }
}
