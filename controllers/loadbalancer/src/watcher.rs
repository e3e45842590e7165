//! Service watcher.
//!
//! One `kube_runtime::Controller` over Services. Node changes requeue the
//! Services bound to that node (this is what drives failover) and
//! Endpoints changes requeue the bound Service of the same name.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use controller_common::Shutdown;
use controller_common::store::object_key;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// `ObjectRef` for a `namespace/name` key
fn service_ref(key: &str) -> Option<ObjectRef<Service>> {
    let (namespace, name) = key.split_once('/')?;
    Some(ObjectRef::new(name).within(namespace))
}

pub struct Watcher {
    reconciler: Arc<Reconciler>,
    services: Api<Service>,
    nodes: Api<Node>,
    endpoints: Api<Endpoints>,
    concurrency: u16,
    shutdown: Shutdown,
}

impl Watcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        services: Api<Service>,
        nodes: Api<Node>,
        endpoints: Api<Endpoints>,
        concurrency: u16,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            reconciler,
            services,
            nodes,
            endpoints,
            concurrency,
            shutdown,
        }
    }

    /// Watches Services until shutdown; in-flight reconciles finish first.
    pub async fn watch_services(&self) -> Result<(), ControllerError> {
        info!("Starting Service watcher");

        let error_policy = |service: Arc<Service>, error: &ControllerError, ctx: Arc<Reconciler>| {
            let key = object_key(service.as_ref());
            let delay = ctx.backoff.record_failure(&key);
            error!("Reconciliation error for Service {}: {} (retry in {:?})", key, error, delay);
            Action::requeue(delay)
        };

        let reconcile = |service: Arc<Service>, ctx: Arc<Reconciler>| async move {
            let key = object_key(service.as_ref());
            debug!("Reconciling Service {}", key);
            let action = ctx.reconcile_service(&service).await?;
            ctx.backoff.reset(&key);
            Ok::<Action, ControllerError>(action)
        };

        let node_ctx = self.reconciler.clone();
        let on_node = move |node: Node| {
            let services = node_ctx.bindings.services_on(&node.name_any());
            if !services.is_empty() {
                debug!("Node {} changed, requeueing {:?}", node.name_any(), services);
            }
            services.iter().filter_map(|key| service_ref(key)).collect::<Vec<_>>()
        };

        let endpoints_ctx = self.reconciler.clone();
        let on_endpoints = move |endpoints: Endpoints| {
            let key = object_key(&endpoints);
            endpoints_ctx.bindings.get(&key).and_then(|_| service_ref(&key))
        };

        // Debounce batches bursts of node and endpoint updates
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(self.concurrency);

        Controller::new(self.services.clone(), watcher::Config::default())
            .watches(self.nodes.clone(), watcher::Config::default(), on_node)
            .watches(self.endpoints.clone(), watcher::Config::default(), on_endpoints)
            .with_config(controller_config)
            .graceful_shutdown_on(self.shutdown.clone().wait())
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    error!("Controller error for Service: {}", e);
                }
            })
            .await;

        info!("Service watcher stopped");
        Ok(())
    }
}
