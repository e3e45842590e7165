//! Test utilities for unit testing the reconciler
//!
//! A `Harness` wires a `Reconciler` to the mock cloud, in-memory record
//! stores and an in-memory forwarder. `restart()` builds a fresh reconciler
//! over the same state, as a controller restart would.

use crate::error::ControllerError;
use crate::forwarding::{Forwarder, ForwardingSpec, ForwardingUnit, is_current};
use crate::reconciler::{CONDITION_ALLOCATED, ReconcileSettings, Reconciler, ingress_ip};
use async_trait::async_trait;
use cloudsigma_client::MockCloudClient;
use cloudsigma_client::mock::fixture_server;
use controller_common::Metrics;
use controller_common::testing::MemoryStore;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeCondition, NodeSpec, NodeStatus, Service,
    ServicePort, ServiceSpec,
};
use kube::api::ObjectMeta;
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "prod";

#[derive(Debug, Default)]
struct Units {
    units: BTreeMap<String, ForwardingUnit>,
    created: usize,
    removed: usize,
}

/// In-memory `Forwarder`; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryForwarder {
    inner: Arc<Mutex<Units>>,
}

impl MemoryForwarder {
    fn lock(&self) -> MutexGuard<'_, Units> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn units(&self) -> Vec<ForwardingUnit> {
        self.lock().units.values().cloned().collect()
    }

    pub fn unit(&self, name: &str) -> Option<ForwardingUnit> {
        self.lock().units.get(name).cloned()
    }

    /// Units created or replaced so far
    pub fn created(&self) -> usize {
        self.lock().created
    }

    pub fn removed(&self) -> usize {
        self.lock().removed
    }

    /// Drop every unit without counting, as a node reboot would
    pub fn wipe(&self) {
        self.lock().units.clear();
    }

    /// Plant a unit directly (for test setup)
    pub fn plant(&self, unit: ForwardingUnit) {
        self.lock().units.insert(unit.name.clone(), unit);
    }
}

#[async_trait]
impl Forwarder for MemoryForwarder {
    async fn ensure(&self, spec: &ForwardingSpec, service: &str) -> Result<(), ControllerError> {
        let unit = ForwardingUnit {
            name: spec.unit_name(),
            node: spec.node.clone(),
            service: service.to_string(),
            signature: spec.signature(),
        };
        let mut inner = self.lock();
        // Units are keyed by name, as pods are
        if !inner.units.get(&unit.name).is_some_and(|u| is_current(u, spec, service)) {
            inner.created += 1;
            inner.units.insert(unit.name.clone(), unit);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ControllerError> {
        let mut inner = self.lock();
        if inner.units.remove(name).is_some() {
            inner.removed += 1;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ForwardingUnit>, ControllerError> {
        Ok(self.units())
    }
}

pub fn test_settings() -> ReconcileSettings {
    ReconcileSettings {
        resync_interval: Duration::from_secs(300),
    }
}

pub struct Harness {
    pub cloud: MockCloudClient,
    pub services: MemoryStore<Service>,
    pub nodes: MemoryStore<Node>,
    pub endpoints: MemoryStore<Endpoints>,
    pub forwarder: MemoryForwarder,
    pub reconciler: Arc<Reconciler>,
}

fn reconciler(
    cloud: &MockCloudClient,
    services: &MemoryStore<Service>,
    nodes: &MemoryStore<Node>,
    endpoints: &MemoryStore<Endpoints>,
    forwarder: &MemoryForwarder,
) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        Arc::new(cloud.clone()),
        Arc::new(services.clone()),
        Arc::new(nodes.clone()),
        Arc::new(endpoints.clone()),
        Arc::new(forwarder.clone()),
        CLUSTER,
        Metrics::new().expect("metrics"),
        test_settings(),
    ))
}

impl Harness {
    /// Two static addresses, one dynamic, no nodes
    pub fn new() -> Self {
        let cloud = MockCloudClient::new("zrh");
        cloud.add_ip("203.0.113.10", true);
        cloud.add_ip("203.0.113.11", true);
        cloud.add_ip("198.51.100.5", false);
        let services = MemoryStore::new();
        let nodes = MemoryStore::new();
        let endpoints = MemoryStore::new();
        let forwarder = MemoryForwarder::default();
        let reconciler = reconciler(&cloud, &services, &nodes, &endpoints, &forwarder);
        Self {
            cloud,
            services,
            nodes,
            endpoints,
            forwarder,
            reconciler,
        }
    }

    /// Harness with ready nodes `n1`, `n2` on servers `srv-1`, `srv-2`
    pub fn with_nodes() -> Self {
        let harness = Self::new();
        harness.add_node("n1", "srv-1", true);
        harness.add_node("n2", "srv-2", true);
        harness
    }

    /// Fresh reconciler over the same cloud, stores and forwarder
    pub fn restart(&mut self) {
        self.reconciler = reconciler(&self.cloud, &self.services, &self.nodes, &self.endpoints, &self.forwarder);
    }

    pub fn add_node(&self, name: &str, server_uuid: &str, ready: bool) {
        self.cloud.add_server(fixture_server(server_uuid, name));
        self.nodes.insert(create_test_node(name, server_uuid, ready));
    }

    pub fn set_node_ready(&self, name: &str, ready: bool) {
        self.nodes.modify(None, name, |node| {
            let server_uuid = crate::nodes::server_uuid(node).unwrap_or_default().to_string();
            *node = create_test_node(name, &server_uuid, ready);
        });
    }

    pub fn add_service(&self, name: &str) -> Service {
        self.services.insert(create_test_service(name, 80))
    }

    pub fn service(&self, name: &str) -> Service {
        self.services.snapshot(Some(NAMESPACE), name).expect("service exists")
    }

    pub fn ingress(&self, name: &str) -> Option<String> {
        ingress_ip(&self.service(name))
    }

    /// `(status, reason)` of the allocation condition
    pub fn condition(&self, name: &str) -> Option<(String, String)> {
        self.service(name)
            .status?
            .conditions?
            .into_iter()
            .find(|c| c.type_ == CONDITION_ALLOCATED)
            .map(|c| (c.status, c.reason))
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action, ControllerError> {
        let service = self.service(name);
        self.reconciler.reconcile_service(&service).await
    }
}

/// Node `name` backed by server `server_uuid`
pub fn create_test_node(name: &str, server_uuid: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(crds::provider_id(server_uuid)),
            ..NodeSpec::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..NodeCondition::default()
            }]),
            ..NodeStatus::default()
        }),
    }
}

/// LoadBalancer Service with one TCP port and cluster IP `10.96.0.10`
pub fn create_test_service(name: &str, port: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// Endpoints of Service `name` with ready `addresses` on `port`
pub fn create_test_endpoints(name: &str, addresses: &[&str], port: i32) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                addresses
                    .iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).to_string(),
                        ..EndpointAddress::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("http".to_string()),
                port,
                protocol: Some("TCP".to_string()),
                ..EndpointPort::default()
            }]),
            ..EndpointSubset::default()
        }]),
    }
}
