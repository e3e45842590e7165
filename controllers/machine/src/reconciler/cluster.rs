//! CloudCluster reconciliation
//!
//! A cluster owns one private VLAN, claimed by writing the cluster's uid
//! into the VLAN meta. VLANs are never created or destroyed here, only
//! claimed from the account's subscription and released on deletion.

use super::Reconciler;
use crate::error::ControllerError;
use cloudsigma_client::ownership::{MANAGED_BY, MANAGER, VLAN_CIDR, VLAN_CLUSTER_NAME, VLAN_CLUSTER_UID};
use cloudsigma_client::{CloudClientTrait, Vlan};
use controller_common::store::{add_finalizer, is_deleting, object_key, remove_finalizer};
use crds::{CLUSTER_FINALIZER, CONDITION_NETWORK_READY, CloudCluster, CloudClusterStatus, Condition, ConditionStatus, set_condition};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner of a VLAN according to its meta
fn vlan_owner(vlan: &Vlan) -> Option<&str> {
    vlan.meta.get(VLAN_CLUSTER_UID).map(String::as_str).filter(|uid| !uid.is_empty())
}

fn claim_meta(vlan: &Vlan, cluster: &CloudCluster, uid: &str) -> BTreeMap<String, String> {
    let mut meta = vlan.meta.clone();
    meta.insert(VLAN_CLUSTER_UID.to_string(), uid.to_string());
    meta.insert(VLAN_CLUSTER_NAME.to_string(), cluster.name_any());
    meta.insert(VLAN_CIDR.to_string(), cluster.spec.network_cidr.clone());
    meta.insert(MANAGED_BY.to_string(), MANAGER.to_string());
    meta
}

fn release_meta(vlan: &Vlan) -> BTreeMap<String, String> {
    let mut meta = vlan.meta.clone();
    meta.remove(VLAN_CLUSTER_UID);
    meta.remove(VLAN_CLUSTER_NAME);
    meta.remove(VLAN_CIDR);
    if meta.get(MANAGED_BY).map(String::as_str) == Some(MANAGER) {
        meta.remove(MANAGED_BY);
    }
    meta
}

impl Reconciler {
    /// Reconciles one CloudCluster.
    pub async fn reconcile_cluster(&self, cluster: &CloudCluster) -> Result<Action, ControllerError> {
        let result = self.reconcile_cluster_locked(cluster).await;
        match &result {
            Ok(_) => self.metrics.reconciled("cluster", "ok"),
            Err(e) => {
                if let Some(cloud) = e.cloud() {
                    self.note_cloud_error(cluster.spec.identity.as_deref(), cloud);
                }
                self.metrics.reconciled("cluster", "error");
            }
        }
        result
    }

    async fn reconcile_cluster_locked(&self, cluster: &CloudCluster) -> Result<Action, ControllerError> {
        let key = object_key(cluster);
        let uid = cluster
            .uid()
            .ok_or_else(|| ControllerError::InvalidResource(format!("CloudCluster {key} has no uid")))?;

        let _guard = self.locks.lock(&uid).await;

        let namespace = cluster.namespace();
        let Some(cluster) = self.clusters.get(namespace.as_deref(), &cluster.name_any()).await? else {
            debug!("CloudCluster {} is gone", key);
            return Ok(Action::await_change());
        };

        let client = self.client_for(cluster.spec.identity.as_deref()).await?;

        if is_deleting(&cluster) {
            self.release_networks(&cluster, &uid, client.as_ref()).await?;
            remove_finalizer(self.clusters.as_ref(), &cluster, CLUSTER_FINALIZER).await?;
            info!("CloudCluster {} cleaned up", key);
            return Ok(Action::await_change());
        }

        let cluster = add_finalizer(self.clusters.as_ref(), &cluster, CLUSTER_FINALIZER).await?;

        let recorded = cluster
            .status
            .as_ref()
            .and_then(CloudClusterStatus::network_id)
            .map(str::to_string);
        let vlan = match recorded {
            Some(id) => match self.verify_network(&cluster, &uid, client.as_ref(), &id).await? {
                Some(vlan) => vlan,
                None => return Ok(Action::requeue(Duration::ZERO)),
            },
            None => match self.claim_network(&cluster, &uid, client.as_ref()).await? {
                Some(vlan) => vlan,
                None => return Ok(Action::requeue(self.settings.poll_interval)),
            },
        };

        self.update_cluster_status(&cluster, |status| {
            status.network_id = Some(vlan.uuid.clone());
            status.ready = true;
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_NETWORK_READY, ConditionStatus::True, "NetworkClaimed", vlan.uuid.as_str()),
            );
            Ok(())
        })
        .await?;

        Ok(Action::requeue(self.settings.resync_interval))
    }

    /// Check the recorded VLAN is still ours. `None` means the record was
    /// cleared and the cluster needs a fresh claim.
    async fn verify_network(
        &self,
        cluster: &CloudCluster,
        uid: &str,
        client: &dyn CloudClientTrait,
        network_id: &str,
    ) -> Result<Option<Vlan>, ControllerError> {
        let key = object_key(cluster);
        let vlan = match client.get_vlan(network_id).await {
            Ok(vlan) => vlan,
            Err(e) if e.is_not_found() || e.is_permission_denied() => {
                warn!("VLAN {} of CloudCluster {} is gone or inaccessible: {}", network_id, key, e);
                self.clear_network(cluster, network_id, "NetworkLost").await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match vlan_owner(&vlan) {
            Some(owner) if owner == uid => Ok(Some(vlan)),
            Some(owner) => {
                warn!("VLAN {} recorded by CloudCluster {} is claimed by {}", network_id, key, owner);
                self.clear_network(cluster, network_id, "NetworkClaimedElsewhere").await?;
                Ok(None)
            }
            None => {
                info!("Re-tagging VLAN {} for CloudCluster {}", network_id, key);
                Ok(Some(client.update_vlan_meta(network_id, &claim_meta(&vlan, cluster, uid)).await?))
            }
        }
    }

    /// Adopt the VLAN already tagged with our uid, or claim the first free one
    async fn claim_network(
        &self,
        cluster: &CloudCluster,
        uid: &str,
        client: &dyn CloudClientTrait,
    ) -> Result<Option<Vlan>, ControllerError> {
        let key = object_key(cluster);
        let mut vlans = client.list_vlans().await?;
        vlans.sort_by(|a, b| a.uuid.cmp(&b.uuid));

        if let Some(vlan) = vlans.iter().find(|v| vlan_owner(v) == Some(uid)) {
            info!("Adopting VLAN {} already claimed by CloudCluster {}", vlan.uuid, key);
            return Ok(Some(vlan.clone()));
        }

        let Some(candidate) = vlans.iter().find(|v| vlan_owner(v).is_none()) else {
            warn!("No unclaimed VLAN available for CloudCluster {}", key);
            self.update_cluster_status(cluster, |status| {
                status.ready = false;
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_NETWORK_READY,
                        ConditionStatus::False,
                        "NoNetworkAvailable",
                        "every VLAN of the account is claimed",
                    ),
                );
                Ok(())
            })
            .await?;
            return Ok(None);
        };

        client.update_vlan_meta(&candidate.uuid, &claim_meta(candidate, cluster, uid)).await?;
        let claimed = client.get_vlan(&candidate.uuid).await?;
        if vlan_owner(&claimed) != Some(uid) {
            warn!("Lost the claim on VLAN {} for CloudCluster {}, retrying", candidate.uuid, key);
            return Ok(None);
        }

        info!("Claimed VLAN {} for CloudCluster {}", claimed.uuid, key);
        Ok(Some(claimed))
    }

    async fn clear_network(&self, cluster: &CloudCluster, stale: &str, reason: &str) -> Result<(), ControllerError> {
        self.update_cluster_status(cluster, |status| {
            if status.network_id() == Some(stale) {
                status.network_id = None;
                status.ready = false;
                set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_NETWORK_READY, ConditionStatus::False, reason, stale),
                );
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Drop our tags from every VLAN we own
    async fn release_networks(&self, cluster: &CloudCluster, uid: &str, client: &dyn CloudClientTrait) -> Result<(), ControllerError> {
        let key = object_key(cluster);
        for vlan in client.list_vlans().await? {
            if vlan_owner(&vlan) != Some(uid) {
                continue;
            }
            match client.update_vlan_meta(&vlan.uuid, &release_meta(&vlan)).await {
                Ok(_) => info!("Released VLAN {} of CloudCluster {}", vlan.uuid, key),
                Err(e) if e.is_not_found() || e.is_permission_denied() => {
                    warn!("Could not release VLAN {} of CloudCluster {}: {}", vlan.uuid, key, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
