//! CloudSigma Machine Controller
//!
//! Reconciles infrastructure CRDs against the CloudSigma API:
//! - CloudMachine: one server with its drives, NICs and cloud-init payload
//! - CloudCluster: the private VLAN the machines of a cluster join
//!
//! Each CloudMachine is bound to at most one server through its recorded
//! instance ID and the `(name, uid)` ownership meta on the server.

mod config;
mod controller;
mod error;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use controller_common::{Shutdown, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    telemetry::init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting CloudSigma Machine Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Region: {}", config.region);
    info!("  API URL: {}", config.api_url);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Impersonation: {}", config.token_exchange_url.is_some());

    let shutdown = Shutdown::from_signals();
    let controller = Controller::new(&config, shutdown).await?;
    controller.run().await
}
