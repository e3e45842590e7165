//! Reconciliation logic for CloudMachine and CloudCluster.
//!
//! - `machine`: server lifecycle, self-heal of stale instance IDs, teardown
//! - `provision`: drive preparation and the create-server request
//! - `cluster`: VLAN claim and release for a CloudCluster

pub mod cluster;
#[cfg(test)]
mod cluster_test;
pub mod machine;
#[cfg(test)]
mod machine_test;
pub mod provision;

use crate::error::ControllerError;
use cloudsigma_client::ownership::find_owned_server;
use cloudsigma_client::{CloudClientProvider, CloudClientTrait, CloudError, KeyedLocks};
use controller_common::store::object_key;
use controller_common::{BackoffRegistry, Metrics, RecordStore, StoreError};
use crds::{CloudCluster, CloudClusterStatus, CloudMachine, CloudMachineStatus};
use kube::ResourceExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bound on re-fetch-and-retry rounds for one status write
pub const MAX_STATUS_RETRIES: usize = 5;

/// Timing knobs of the reconcilers
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    /// Upper bound on drive clone and server state waits
    pub clone_timeout: Duration,
    /// Interval between polls while waiting
    pub poll_interval: Duration,
    /// Requeue interval for converged resources
    pub resync_interval: Duration,
}

/// Reconciles CloudSigma infrastructure resources.
pub struct Reconciler {
    pub(crate) provider: Arc<dyn CloudClientProvider>,
    pub(crate) machines: Arc<dyn RecordStore<CloudMachine>>,
    pub(crate) clusters: Arc<dyn RecordStore<CloudCluster>>,
    /// Serializes reconciles of one record (keyed by object uid)
    pub(crate) locks: KeyedLocks,
    pub(crate) backoff: BackoffRegistry,
    pub(crate) metrics: Metrics,
    pub(crate) settings: ReconcileSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").field("settings", &self.settings).finish_non_exhaustive()
    }
}

/// Status patch that also clears optional fields.
///
/// The status types skip `None` when serializing; a merge patch needs an
/// explicit `null` to remove a key.
pub(crate) fn status_patch_with_nulls<S: serde::Serialize>(
    resource_version: Option<String>,
    status: &S,
    optional_keys: &[&str],
) -> Result<Value, serde_json::Error> {
    let mut status = serde_json::to_value(status)?;
    if let Value::Object(map) = &mut status {
        for key in optional_keys {
            map.entry((*key).to_string()).or_insert(Value::Null);
        }
    }
    Ok(json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    }))
}

const MACHINE_OPTIONAL_STATUS: &[&str] = &["instanceId", "instanceState", "providerId", "failureMessage"];
const CLUSTER_OPTIONAL_STATUS: &[&str] = &["networkId"];

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        provider: Arc<dyn CloudClientProvider>,
        machines: Arc<dyn RecordStore<CloudMachine>>,
        clusters: Arc<dyn RecordStore<CloudCluster>>,
        metrics: Metrics,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            provider,
            machines,
            clusters,
            locks: KeyedLocks::new(),
            backoff: BackoffRegistry::new(Duration::from_secs(5), settings.resync_interval),
            metrics,
            settings,
        }
    }

    /// Client for the record's identity
    pub(crate) async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn CloudClientTrait>, ControllerError> {
        Ok(self.provider.client_for(identity).await?)
    }

    /// Bookkeeping after a cloud failure: count it and drop rejected tokens
    pub(crate) fn note_cloud_error(&self, identity: Option<&str>, error: &CloudError) {
        self.metrics.cloud_error(error.kind());
        if let (Some(user), CloudError::Authentication(_)) = (identity, error) {
            self.provider.invalidate(user);
        }
    }

    /// Re-read the machine and apply `mutate` to its status, retrying on
    /// version conflicts.
    ///
    /// `mutate` sees the freshest status each round and may refuse the
    /// write by returning an error. Nothing is written when it leaves the
    /// status unchanged. Returns the stored machine, or `None` if it is gone.
    pub(crate) async fn update_machine_status<F>(
        &self,
        machine: &CloudMachine,
        mut mutate: F,
    ) -> Result<Option<CloudMachine>, ControllerError>
    where
        F: FnMut(&mut CloudMachineStatus) -> Result<(), ControllerError>,
    {
        let namespace = machine.namespace();
        let name = machine.name_any();
        let key = object_key(machine);

        for attempt in 1..=MAX_STATUS_RETRIES {
            let Some(current) = self.machines.get(namespace.as_deref(), &name).await? else {
                debug!("CloudMachine {} disappeared before status write", key);
                return Ok(None);
            };

            let before = current.status.clone().unwrap_or_default();
            let mut status = before.clone();
            mutate(&mut status)?;
            if status == before {
                return Ok(Some(current));
            }

            let patch = status_patch_with_nulls(current.resource_version(), &status, MACHINE_OPTIONAL_STATUS)?;
            match self.machines.patch_status(namespace.as_deref(), &name, &patch).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::Conflict(_)) => {
                    warn!("Status write conflict for CloudMachine {} (attempt {}/{})", key, attempt, MAX_STATUS_RETRIES);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::Conflict(key))
    }

    /// Cluster counterpart of [`Self::update_machine_status`]
    pub(crate) async fn update_cluster_status<F>(
        &self,
        cluster: &CloudCluster,
        mut mutate: F,
    ) -> Result<Option<CloudCluster>, ControllerError>
    where
        F: FnMut(&mut CloudClusterStatus) -> Result<(), ControllerError>,
    {
        let namespace = cluster.namespace();
        let name = cluster.name_any();
        let key = object_key(cluster);

        for attempt in 1..=MAX_STATUS_RETRIES {
            let Some(current) = self.clusters.get(namespace.as_deref(), &name).await? else {
                return Ok(None);
            };

            let before = current.status.clone().unwrap_or_default();
            let mut status = before.clone();
            mutate(&mut status)?;
            if status == before {
                return Ok(Some(current));
            }

            let patch = status_patch_with_nulls(current.resource_version(), &status, CLUSTER_OPTIONAL_STATUS)?;
            match self.clusters.patch_status(namespace.as_deref(), &name, &patch).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::Conflict(_)) => {
                    warn!("Status write conflict for CloudCluster {} (attempt {}/{})", key, attempt, MAX_STATUS_RETRIES);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControllerError::Conflict(key))
    }

    /// Performs startup reconciliation to map existing servers back to
    /// CloudMachines.
    ///
    /// Covers a crash between "server created" and "instance ID recorded":
    /// every live machine with an empty instance ID is matched against the
    /// servers carrying its `(name, uid)` ownership meta and adopts the
    /// match. Per-machine failures are logged and left to the regular
    /// reconcile loop.
    pub async fn startup_reconciliation(&self) -> Result<(), ControllerError> {
        info!("Starting startup reconciliation for CloudMachine resources...");

        let machines = self.machines.list().await?;
        info!("Found {} CloudMachines to check", machines.len());

        let mut adopted = 0;
        for machine in machines {
            let key = object_key(&machine);
            if controller_common::store::is_deleting(&machine)
                || machine.status.as_ref().and_then(CloudMachineStatus::instance_id).is_some()
            {
                continue;
            }
            let Some(uid) = machine.uid() else {
                continue;
            };

            let identity = machine.spec.identity.as_deref();
            let client = match self.client_for(identity).await {
                Ok(client) => client,
                Err(e) => {
                    error!("No client for CloudMachine {}: {}", key, e);
                    continue;
                }
            };

            match find_owned_server(client.as_ref(), &machine.name_any(), &uid).await {
                Ok(Some(server)) => {
                    let result = self
                        .update_machine_status(&machine, |status| {
                            machine::record_instance(&key, status, &server.uuid)?;
                            machine::apply_observed(status, &server);
                            Ok(())
                        })
                        .await;
                    match result {
                        Ok(_) => {
                            info!("Adopted server {} for CloudMachine {}", server.uuid, key);
                            adopted += 1;
                        }
                        Err(e) => error!("Failed to record adopted server for {}: {}", key, e),
                    }
                }
                Ok(None) => debug!("No existing server for CloudMachine {}", key),
                Err(e) => {
                    self.note_cloud_error(identity, &e);
                    error!("Failed to search servers for CloudMachine {}: {}", key, e);
                }
            }
        }

        info!("Startup reconciliation complete: {} adopted", adopted);
        Ok(())
    }
}
