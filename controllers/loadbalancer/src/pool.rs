//! Floating IP pools and the tag-based claim.
//!
//! Pools are derived from the IP list on every allocation: `static` holds
//! the subscribed addresses, `dynamic` the unsubscribed ones no server has
//! attached. An address belongs to a Service once its meta carries the
//! `{cluster, service, managed-by}` tags.
//!
//! The backend has no compare-and-swap on meta, so a claim is written and
//! read back. Within one process the claim mutex serializes allocations;
//! across processes only a single active controller per cluster is safe.

use crate::error::ControllerError;
use cloudsigma_client::ownership::{ip_is_tagged, ip_owner, ip_tags, without_ip_tags};
use cloudsigma_client::{CloudClientTrait, FloatingIp};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Service annotation selecting the pool an address is taken from
pub const POOL_ANNOTATION: &str = "cloudsigma.com/floating-ip-pool";

/// Allocation pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    /// Subscribed addresses
    #[default]
    Static,
    /// Unsubscribed, unattached addresses
    Dynamic,
}

impl PoolKind {
    /// Pool requested by a Service's annotations; `static` when absent
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self, ControllerError> {
        match annotations.get(POOL_ANNOTATION).map(|v| v.trim()) {
            None | Some("") | Some("static") => Ok(Self::Static),
            Some("dynamic") => Ok(Self::Dynamic),
            Some(other) => Err(ControllerError::InvalidResource(format!(
                "{POOL_ANNOTATION}={other}: expected \"static\" or \"dynamic\""
            ))),
        }
    }

    /// Pool an address falls in, if any
    pub fn classify(ip: &FloatingIp) -> Option<Self> {
        if ip.has_subscription() {
            Some(Self::Static)
        } else if ip.attached_server().is_none() {
            Some(Self::Dynamic)
        } else {
            None
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("static"),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Ordering of addresses: numeric for IPv4, text for anything else
fn address_order(address: &str) -> (Option<Ipv4Addr>, &str) {
    (address.parse().ok(), address)
}

/// Lowest free address of `kind`.
///
/// Free means untagged by any cluster and not attached to a server, so an
/// address in use outside the controllers is never taken.
pub fn pick_free(ips: &[FloatingIp], kind: PoolKind) -> Option<&FloatingIp> {
    ips.iter()
        .filter(|ip| PoolKind::classify(ip) == Some(kind))
        .filter(|ip| !ip_is_tagged(&ip.meta) && ip.attached_server().is_none())
        .min_by(|a, b| {
            let (a, b) = (address_order(a.address()), address_order(b.address()));
            // Parsed IPv4 addresses sort before unparsable ones
            match (a.0, b.0) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.1.cmp(b.1),
            }
        })
}

/// Pool sizes as seen by one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub static_total: usize,
    pub static_free: usize,
    pub dynamic_total: usize,
    pub dynamic_free: usize,
    /// Addresses tagged by this cluster
    pub owned: usize,
}

/// Classify the IP list into pool counts
pub fn pool_stats(ips: &[FloatingIp], cluster: &str) -> PoolStats {
    let mut stats = PoolStats::default();
    for ip in ips {
        let free = !ip_is_tagged(&ip.meta) && ip.attached_server().is_none();
        match PoolKind::classify(ip) {
            Some(PoolKind::Static) => {
                stats.static_total += 1;
                stats.static_free += usize::from(free);
            }
            Some(PoolKind::Dynamic) => {
                stats.dynamic_total += 1;
                stats.dynamic_free += usize::from(free);
            }
            None => {}
        }
        if ip_owner(&ip.meta, cluster).is_some() {
            stats.owned += 1;
        }
    }
    stats
}

/// Tags addresses for the Services of one cluster
#[derive(Debug)]
pub struct IpAllocator {
    cluster: String,
    claim: Mutex<()>,
}

impl IpAllocator {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            claim: Mutex::new(()),
        }
    }

    /// Cluster name written into the tags
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Service that `ip` is tagged for by this cluster
    pub fn owner<'a>(&self, ip: &'a FloatingIp) -> Option<&'a str> {
        ip_owner(&ip.meta, &self.cluster)
    }

    /// Address for `service_key`: the one already tagged for it, else the
    /// lowest free address of `kind`, claimed by tagging.
    pub async fn allocate(
        &self,
        client: &dyn CloudClientTrait,
        service_key: &str,
        kind: PoolKind,
    ) -> Result<String, ControllerError> {
        let _claim = self.claim.lock().await;

        let ips = client.list_ips().await?;
        if let Some(owned) = ips.iter().find(|ip| self.owner(ip) == Some(service_key)) {
            debug!("{} already holds {}", service_key, owned.address());
            return Ok(owned.address().to_string());
        }

        let candidate = pick_free(&ips, kind).ok_or_else(|| {
            ControllerError::PoolExhausted(format!("no free {kind} address for {service_key}"))
        })?;
        let address = candidate.address().to_string();
        self.tag(client, candidate, service_key).await?;
        info!("Claimed {} address {} for {}", kind, address, service_key);
        Ok(address)
    }

    /// Re-tag `address` for `service_key` when it carries no tags.
    ///
    /// Used when a Service's status already names the address but its tags
    /// were lost. An address tagged for anyone else is refused.
    pub async fn reclaim(
        &self,
        client: &dyn CloudClientTrait,
        address: &str,
        service_key: &str,
    ) -> Result<bool, ControllerError> {
        let _claim = self.claim.lock().await;

        let ip = match client.get_ip(address).await {
            Ok(ip) => ip,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if self.owner(&ip) == Some(service_key) {
            return Ok(true);
        }
        if ip_is_tagged(&ip.meta) {
            return Ok(false);
        }
        self.tag(client, &ip, service_key).await?;
        warn!("Re-tagged {} for {} after its tags were lost", address, service_key);
        Ok(true)
    }

    async fn tag(&self, client: &dyn CloudClientTrait, ip: &FloatingIp, service_key: &str) -> Result<(), ControllerError> {
        let mut meta = ip.meta.clone();
        meta.extend(ip_tags(&self.cluster, service_key));
        client.update_ip_meta(ip.address(), &meta).await?;

        let read_back = client.get_ip(ip.address()).await?;
        if self.owner(&read_back) != Some(service_key) {
            warn!(
                "Claim of {} for {} lost: tags now name {:?}",
                ip.address(),
                service_key,
                read_back.meta
            );
            return Err(ControllerError::Conflict(format!("claim of {} for {}", ip.address(), service_key)));
        }
        Ok(())
    }

    /// Remove the tags from `address` if they name `service_key`.
    ///
    /// Returns whether tags were removed. A vanished address counts as
    /// released.
    pub async fn release(
        &self,
        client: &dyn CloudClientTrait,
        address: &str,
        service_key: &str,
    ) -> Result<bool, ControllerError> {
        let ip = match client.get_ip(address).await {
            Ok(ip) => ip,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if self.owner(&ip) != Some(service_key) {
            return Ok(false);
        }
        match client.update_ip_meta(address, &without_ip_tags(&ip.meta)).await {
            Ok(_) => {
                info!("Released {} from {}", address, service_key);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// `(address, service)` for every address this cluster has tagged
    pub async fn owned(&self, client: &dyn CloudClientTrait) -> Result<Vec<(String, String)>, ControllerError> {
        let ips = client.list_ips().await?;
        Ok(ips
            .iter()
            .filter_map(|ip| self.owner(ip).map(|svc| (ip.address().to_string(), svc.to_string())))
            .collect())
    }
}
