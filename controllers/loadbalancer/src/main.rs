//! CloudSigma LoadBalancer Controller
//!
//! Gives every `type: LoadBalancer` Service a CloudSigma floating IP:
//! - claims an address from the static or dynamic pool by tagging it
//! - attaches it to a healthy node's server and forwards it to the Service
//! - moves it to another node when the hosting node fails
//! - untags and detaches it when the Service goes away
//!
//! Claims are not atomic; run a single active instance per cluster.

mod binding;
mod config;
mod controller;
mod error;
mod forwarding;
mod nodes;
mod pool;
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

    info!("Starting CloudSigma LoadBalancer Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Region: {}", config.region);
    info!("  API URL: {}", config.api_url);
    info!("  Cluster: {}", config.cluster_name);
    info!("  Forwarders: {} ({})", config.forwarder_namespace, config.forwarder_image);

    let shutdown = Shutdown::from_signals();
    let controller = Controller::new(&config, shutdown).await?;
    controller.run().await
}
