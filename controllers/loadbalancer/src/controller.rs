//! Main controller implementation.
//!
//! Wires the CloudSigma client, the record stores, the pod forwarder and
//! the reconciler together, recovers bindings, then runs the Service
//! watcher and the discovery loop. On shutdown the watcher drains and the
//! claims of vanished Services are released within the grace period.

use crate::config::Config;
use crate::error::ControllerError;
use crate::forwarding::PodForwarder;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::watcher::Watcher;
use cloudsigma_client::{CloudClientTrait, CloudSigmaClient, Credentials};
use controller_common::{KubeStore, Metrics, Readiness, Shutdown, serve_probes};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Requeue interval for bound Services
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Concurrent Service reconciles
const CONCURRENCY: u16 = 4;

pub struct Controller {
    reconciler: Arc<Reconciler>,
    service_watcher: JoinHandle<Result<(), ControllerError>>,
    discovery: JoinHandle<()>,
    probe_server: JoinHandle<std::io::Result<()>>,
    shutdown_grace: Duration,
}

async fn discovery_loop(reconciler: Arc<Reconciler>, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    // Recovery has just refreshed everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.discover().await {
                    warn!("Floating IP discovery failed: {}", e);
                }
            }
            _ = shutdown.clone().wait() => break,
        }
    }
    info!("Discovery loop stopped");
}

impl Controller {
    pub async fn new(config: &Config, shutdown: Shutdown) -> Result<Self, ControllerError> {
        info!("Initializing CloudSigma LoadBalancer Controller");

        let metrics = Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("metrics registry: {e}")))?;
        let readiness = Readiness::default();
        let probe_server = tokio::spawn(serve_probes(
            config.probe_addr,
            metrics.clone(),
            readiness.clone(),
            shutdown.clone(),
        ));

        let kube_client = Client::try_default().await?;

        let cloud = CloudSigmaClient::new(
            config.api_url.clone(),
            config.region.clone(),
            Credentials::Basic {
                username: config.username.clone(),
                password: config.password.clone(),
            },
        )?;
        info!("Validating CloudSigma credentials...");
        cloud.validate_credentials().await.map_err(|e| {
            error!("Failed to validate CloudSigma credentials: {}", e);
            error!("Please ensure:");
            error!("  1. CLOUDSIGMA_USERNAME and CLOUDSIGMA_PASSWORD are set correctly");
            error!("  2. The account exists in region {}", config.region);
            error!("  3. The API is reachable at {}", config.api_url);
            ControllerError::Cloud(e)
        })?;
        info!("CloudSigma credentials validated");

        warn!(
            "Floating IP claims are tag-based and not atomic: exactly one LoadBalancer controller may run for cluster {}",
            config.cluster_name
        );

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(cloud),
            Arc::new(KubeStore::<Service>::namespaced(kube_client.clone(), None)),
            Arc::new(KubeStore::<Node>::cluster(kube_client.clone())),
            Arc::new(KubeStore::<Endpoints>::namespaced(kube_client.clone(), None)),
            Arc::new(PodForwarder::new(
                kube_client.clone(),
                &config.forwarder_namespace,
                &config.forwarder_image,
            )),
            &config.cluster_name,
            metrics,
            ReconcileSettings {
                resync_interval: RESYNC_INTERVAL,
            },
        ));

        // Bindings are rebuilt from Service status and tags only
        match reconciler.recover().await {
            Ok(report) => info!("Recovered {} binding(s)", report.rebuilt),
            Err(e) => warn!("Recovery failed (will continue): {}", e),
        }
        readiness.set_ready();

        let watcher = Watcher::new(
            reconciler.clone(),
            Api::all(kube_client.clone()),
            Api::all(kube_client.clone()),
            Api::all(kube_client),
            CONCURRENCY,
            shutdown.clone(),
        );
        let service_watcher = tokio::spawn(async move { watcher.watch_services().await });
        let discovery = tokio::spawn(discovery_loop(reconciler.clone(), config.discovery_interval, shutdown));

        info!("Controller initialized, watching LoadBalancer Services");
        Ok(Self {
            reconciler,
            service_watcher,
            discovery,
            probe_server,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Runs until shutdown, then drains within the grace period.
    pub async fn run(self) -> Result<(), ControllerError> {
        let watched = self.service_watcher.await;

        match tokio::time::timeout(self.shutdown_grace, self.reconciler.drain()).await {
            Ok(Ok(released)) => info!("Shutdown drain released {} address(es)", released),
            Ok(Err(e)) => warn!("Shutdown drain failed: {}", e),
            Err(_) => warn!("Shutdown drain exceeded {:?}, exiting with claims in place", self.shutdown_grace),
        }

        if let Err(e) = self.discovery.await {
            error!("Discovery task failed: {}", e);
        }
        match self.probe_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Probe server failed: {}", e),
            Err(e) => error!("Probe server task failed: {}", e),
        }

        watched.map_err(|e| ControllerError::Watch(format!("Service watcher panicked: {e}")))??;
        info!("LoadBalancer Controller stopped");
        Ok(())
    }
}
