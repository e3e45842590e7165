//! Controller configuration, read once from the environment at startup.

use crate::error::ControllerError;
use cloudsigma_client::region_api_url;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration of the load balancer controller
#[derive(Clone)]
pub struct Config {
    /// CloudSigma region (e.g. "zrh")
    pub region: String,
    /// Service account email
    pub username: String,
    /// Service account password
    pub password: String,
    /// API base URL
    pub api_url: String,
    /// Cluster name written into every IP claim
    pub cluster_name: String,
    /// Namespace the forwarding pods run in
    pub forwarder_namespace: String,
    /// Image of the forwarding pods (needs `sh`, `ip` and `iptables`)
    pub forwarder_image: String,
    /// Upper bound on the shutdown drain
    pub shutdown_grace: Duration,
    /// Interval of the pool refresh and orphan sweep
    pub discovery_interval: Duration,
    /// Probe and metrics listen address
    pub probe_addr: SocketAddr,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("username", &self.username)
            .field("api_url", &self.api_url)
            .field("cluster_name", &self.cluster_name)
            .field("forwarder_namespace", &self.forwarder_namespace)
            .field("forwarder_image", &self.forwarder_image)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("discovery_interval", &self.discovery_interval)
            .field("probe_addr", &self.probe_addr)
            .finish_non_exhaustive()
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, ControllerError> {
    lookup(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{name} environment variable is required")))
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration, ControllerError> {
    let secs = match lookup(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{name}={raw} is not a number of seconds")))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let region = required(&lookup, "CLOUDSIGMA_REGION")?;
        let username = required(&lookup, "CLOUDSIGMA_USERNAME")?;
        let password = required(&lookup, "CLOUDSIGMA_PASSWORD")?;
        let cluster_name = required(&lookup, "CLUSTER_NAME")?;
        let api_url = lookup("CLOUDSIGMA_API_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| region_api_url(&region));

        let discovery_interval = seconds(&lookup, "DISCOVERY_INTERVAL_SECS", 60)?;
        if discovery_interval.is_zero() {
            return Err(ControllerError::InvalidConfig("DISCOVERY_INTERVAL_SECS must be positive".to_string()));
        }

        let probe_addr = match lookup("PROBE_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ControllerError::InvalidConfig(format!("PROBE_ADDR={raw} is not a socket address")))?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        Ok(Self {
            region,
            username,
            password,
            api_url,
            cluster_name,
            forwarder_namespace: lookup("FORWARDER_NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "kube-system".to_string()),
            forwarder_image: lookup("FORWARDER_IMAGE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "alpine:3.20".to_string()),
            shutdown_grace: seconds(&lookup, "SHUTDOWN_GRACE_SECS", 30)?,
            discovery_interval,
            probe_addr,
        })
    }
}
