//! Main controller implementation.
//!
//! Wires the cloud client provider, the record stores and the reconciler
//! together, runs startup recovery, then spawns the CloudMachine and
//! CloudCluster watchers next to the probe server.

use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::watcher::Watcher;
use cloudsigma_client::{ClientProvider, CloudClientTrait, HttpTokenSource, TokenCache};
use controller_common::{KubeStore, Metrics, Readiness, Shutdown, serve_probes};
use crds::{CloudCluster, CloudMachine};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Main controller for CloudSigma machines and clusters.
pub struct Controller {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<std::io::Result<()>>,
}

fn token_cache(config: &Config) -> Result<Option<Arc<TokenCache>>, ControllerError> {
    let Some(url) = &config.token_exchange_url else {
        info!("TOKEN_EXCHANGE_URL not set, impersonation disabled");
        return Ok(None);
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ControllerError::InvalidConfig(format!("token exchange client: {e}")))?;
    let source = HttpTokenSource::new(http, url.clone(), config.username.clone(), config.password.clone());
    Ok(Some(Arc::new(TokenCache::new(Arc::new(source)))))
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: &Config, shutdown: Shutdown) -> Result<Self, ControllerError> {
        info!("Initializing CloudSigma Machine Controller");

        let metrics = Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("metrics registry: {e}")))?;
        let readiness = Readiness::default();
        let probe_server = tokio::spawn(serve_probes(
            config.probe_addr,
            metrics.clone(),
            readiness.clone(),
            shutdown.clone(),
        ));

        let kube_client = Client::try_default().await?;

        let provider = ClientProvider::new(
            config.api_url.clone(),
            config.region.clone(),
            config.username.clone(),
            config.password.clone(),
            token_cache(config)?,
        )?;

        // Validate credentials before touching any record
        info!("Validating CloudSigma credentials...");
        provider.service_client().validate_credentials().await.map_err(|e| {
            error!("Failed to validate CloudSigma credentials: {}", e);
            error!("Please ensure:");
            error!("  1. CLOUDSIGMA_USERNAME and CLOUDSIGMA_PASSWORD are set correctly");
            error!("  2. The account exists in region {}", config.region);
            error!("  3. The API is reachable at {}", config.api_url);
            ControllerError::Cloud(e)
        })?;
        info!("CloudSigma credentials validated");

        let namespace = config.namespace.as_deref();
        let machines = KubeStore::<CloudMachine>::namespaced(kube_client.clone(), namespace);
        let clusters = KubeStore::<CloudCluster>::namespaced(kube_client.clone(), namespace);

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(provider),
            Arc::new(machines),
            Arc::new(clusters),
            metrics,
            ReconcileSettings {
                clone_timeout: config.clone_timeout,
                poll_interval: config.poll_interval,
                resync_interval: config.resync_interval,
            },
        ));

        // Map servers created just before a crash back to their records
        info!("Performing startup reconciliation...");
        if let Err(e) = reconciler.startup_reconciliation().await {
            warn!("Startup reconciliation failed (will continue): {}", e);
        }
        readiness.set_ready();

        let watcher = Arc::new(Watcher::new(
            reconciler,
            api_for(&kube_client, namespace),
            api_for(&kube_client, namespace),
            config.concurrency,
            shutdown,
        ));

        let machine_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_machines().await })
        };
        let cluster_watcher = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_clusters().await })
        };

        info!("Controller initialized, watching CloudMachine and CloudCluster");
        Ok(Self {
            machine_watcher,
            cluster_watcher,
            probe_server,
        })
    }

    /// Runs until every watcher has stopped.
    pub async fn run(self) -> Result<(), ControllerError> {
        let (machines, clusters) = tokio::join!(self.machine_watcher, self.cluster_watcher);
        machines.map_err(|e| ControllerError::Watch(format!("CloudMachine watcher panicked: {e}")))??;
        clusters.map_err(|e| ControllerError::Watch(format!("CloudCluster watcher panicked: {e}")))??;

        match self.probe_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Probe server failed: {}", e),
            Err(e) => error!("Probe server task failed: {}", e),
        }
        info!("Machine Controller stopped");
        Ok(())
    }
}
