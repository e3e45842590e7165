//! Kubernetes resource watchers.
//!
//! Both CRDs run through one generic `watch_resource()` helper built on
//! `kube_runtime::Controller`, which provides reconnection, per-key
//! single-flight dispatch and requeue scheduling.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use controller_common::Shutdown;
use controller_common::store::object_key;
use crds::{CloudCluster, CloudMachine};
use futures::StreamExt;
use kube::Api;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Generic watcher helper around `kube_runtime::Controller`.
///
/// Failures requeue with a per-key exponential backoff capped at the resync
/// interval; a success resets that key's backoff. The stream stops once
/// `shutdown` fires, after in-flight reconciles finish.
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
    concurrency: u16,
    shutdown: Shutdown,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = object_key(obj.as_ref());
        let delay = ctx.backoff.record_failure(&key);
        error!(
            "Reconciliation error for {} {}: {} (retry in {:?})",
            resource_name, key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(obj.as_ref());
            debug!("Reconciling {} {}", resource_name, key);
            let action = reconcile_fn(ctx.clone(), obj).await?;
            ctx.backoff.reset(&key);
            Ok::<Action, ControllerError>(action)
        }
    };

    // Debounce batches bursts of status writes into one reconcile
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .graceful_shutdown_on(shutdown.wait())
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    info!("{} watcher stopped", resource_name);
    Ok(())
}

/// Watches CloudMachine and CloudCluster resources.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    machine_api: Api<CloudMachine>,
    cluster_api: Api<CloudCluster>,
    concurrency: u16,
    shutdown: Shutdown,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        machine_api: Api<CloudMachine>,
        cluster_api: Api<CloudCluster>,
        concurrency: u16,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            reconciler,
            machine_api,
            cluster_api,
            concurrency,
            shutdown,
        }
    }

    /// Watches CloudMachine resources until shutdown.
    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.machine_api.clone(),
            self.reconciler.clone(),
            |reconciler, machine| Box::pin(async move { reconciler.reconcile_machine(&machine).await }),
            "CloudMachine",
            self.concurrency,
            self.shutdown.clone(),
        )
        .await
    }

    /// Watches CloudCluster resources until shutdown.
    pub async fn watch_clusters(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.cluster_api.clone(),
            self.reconciler.clone(),
            |reconciler, cluster| Box::pin(async move { reconciler.reconcile_cluster(&cluster).await }),
            "CloudCluster",
            self.concurrency,
            self.shutdown.clone(),
        )
        .await
    }
}
