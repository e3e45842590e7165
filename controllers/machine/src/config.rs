//! Controller configuration, read once from the environment at startup.

use crate::error::ControllerError;
use cloudsigma_client::region_api_url;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration of the machine controller
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
    /// Token exchange endpoint; enables impersonation when set
    pub token_exchange_url: Option<String>,
    /// Namespace to watch (all when unset)
    pub namespace: Option<String>,
    /// Upper bound on drive clone and server state waits
    pub clone_timeout: Duration,
    /// Interval between polls while waiting
    pub poll_interval: Duration,
    /// Requeue interval for converged resources; also caps error backoff
    pub resync_interval: Duration,
    /// Concurrent reconciles per resource kind
    pub concurrency: u16,
    /// Probe and metrics listen address
    pub probe_addr: SocketAddr,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("username", &self.username)
            .field("api_url", &self.api_url)
            .field("token_exchange_url", &self.token_exchange_url)
            .field("namespace", &self.namespace)
            .field("clone_timeout", &self.clone_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("resync_interval", &self.resync_interval)
            .field("concurrency", &self.concurrency)
            .field("probe_addr", &self.probe_addr)
            .finish_non_exhaustive()
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, ControllerError> {
    lookup(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{name} environment variable is required")))
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ControllerError> {
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{name}={raw} is not valid"))),
        None => Ok(default),
    }
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
        let api_url = lookup("CLOUDSIGMA_API_URL").unwrap_or_else(|| region_api_url(&region));

        let poll_interval = Duration::from_secs(parsed(&lookup, "CLONE_POLL_INTERVAL_SECS", 5)?);
        if poll_interval.is_zero() {
            return Err(ControllerError::InvalidConfig("CLONE_POLL_INTERVAL_SECS must be positive".to_string()));
        }
        let concurrency = parsed(&lookup, "CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig("CONCURRENCY must be positive".to_string()));
        }

        Ok(Self {
            region,
            username,
            password,
            api_url,
            token_exchange_url: lookup("TOKEN_EXCHANGE_URL").filter(|v| !v.is_empty()),
            namespace: lookup("WATCH_NAMESPACE").filter(|v| !v.is_empty()),
            clone_timeout: Duration::from_secs(parsed(&lookup, "CLONE_TIMEOUT_SECS", 600)?),
            poll_interval,
            resync_interval: Duration::from_secs(parsed(&lookup, "RESYNC_INTERVAL_SECS", 300)?),
            concurrency,
            probe_addr: parsed(&lookup, "PROBE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("CLOUDSIGMA_REGION", "zrh"),
            ("CLOUDSIGMA_USERNAME", "ops@example.com"),
            ("CLOUDSIGMA_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "https://zrh.cloudsigma.com/api/2.0");
        assert_eq!(config.clone_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.probe_addr.port(), 8080);
        assert!(config.token_exchange_url.is_none());
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let err = Config::from_lookup(lookup(&[("CLOUDSIGMA_REGION", "zrh")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(msg) if msg.contains("CLOUDSIGMA_USERNAME")));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("CLOUDSIGMA_REGION", "zrh"),
            ("CLOUDSIGMA_USERNAME", "ops@example.com"),
            ("CLOUDSIGMA_PASSWORD", "secret"),
            ("CLONE_TIMEOUT_SECS", "ten"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
