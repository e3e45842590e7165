//! CloudMachine reconciliation
//!
//! Binds each CloudMachine to exactly one server. The instance ID in the
//! status is the only link; when it goes stale the server is searched for
//! by its ownership meta before anything new is created.

use super::{Reconciler, provision};
use crate::error::ControllerError;
use cloudsigma_client::ownership::{find_owned_drives, find_owned_server};
use cloudsigma_client::{CloudClientTrait, Server, ServerStatus};
use controller_common::store::{add_finalizer, is_deleting, object_key, remove_finalizer};
use crds::{
    AddressType, CONDITION_INSTANCE_PROVISIONED, CloudMachine, CloudMachineStatus, Condition, ConditionStatus,
    InstanceState, MACHINE_FINALIZER, MachineAddress, provider_id, set_condition,
};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

/// Network a machine's private NICs join
enum ClusterNetwork {
    /// Machine belongs to no cluster
    Public,
    /// Cluster VLAN is claimed
    Ready(String),
    /// Cluster exists but its network is not ready yet
    Waiting(String),
}

/// Record `uuid` as the machine's instance ID.
///
/// Refuses to replace a different non-empty ID: two servers for one
/// machine is the failure this controller exists to prevent, so it is
/// surfaced instead of papered over.
pub(crate) fn record_instance(key: &str, status: &mut CloudMachineStatus, uuid: &str) -> Result<(), ControllerError> {
    if let Some(recorded) = status.instance_id().filter(|id| *id != uuid) {
        error!(
            "CloudMachine {} already records instance {} but server {} also belongs to it",
            key, recorded, uuid
        );
        return Err(ControllerError::InstanceIdConflict {
            key: key.to_string(),
            recorded: recorded.to_string(),
            observed: uuid.to_string(),
        });
    }
    status.instance_id = Some(uuid.to_string());
    status.provider_id = Some(provider_id(uuid));
    Ok(())
}

/// Copy the observed server state into the status
pub(crate) fn apply_observed(status: &mut CloudMachineStatus, server: &Server) {
    let state = instance_state(server.status);
    status.instance_state = Some(state);
    status.addresses = observed_addresses(server);
    status.provider_id = Some(provider_id(&server.uuid));
    status.ready = state == InstanceState::Running;
    status.failure_message = None;
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_INSTANCE_PROVISIONED, ConditionStatus::True, "ServerBound", server.uuid.as_str()),
    );
}

/// Map the cloud server status onto the CRD state
pub(crate) fn instance_state(status: ServerStatus) -> InstanceState {
    match status {
        ServerStatus::Running => InstanceState::Running,
        ServerStatus::Starting => InstanceState::Starting,
        ServerStatus::Stopping => InstanceState::Stopping,
        ServerStatus::Stopped => InstanceState::Stopped,
        ServerStatus::Paused => InstanceState::Paused,
        ServerStatus::Unavailable | ServerStatus::Unknown => InstanceState::Unavailable,
    }
}

/// Addresses reported by the server's NICs, followed by its hostname
pub(crate) fn observed_addresses(server: &Server) -> Vec<MachineAddress> {
    let mut addresses = Vec::new();
    for nic in &server.nics {
        let runtime = nic.runtime.as_ref();
        let runtime_ip = runtime.and_then(|r| r.ip_v4.as_ref()).map(|ip| ip.uuid.clone());
        let static_ip = nic.ip_v4_conf.as_ref().and_then(|conf| conf.ip.as_ref()).map(|ip| ip.uuid.clone());

        let Some(address) = runtime_ip.or(static_ip).filter(|a| !a.is_empty()) else {
            continue;
        };
        let private = nic.vlan.is_some() || runtime.and_then(|r| r.interface_type.as_deref()) == Some("private");
        let address_type = if private { AddressType::InternalIP } else { AddressType::ExternalIP };
        if !addresses.iter().any(|a: &MachineAddress| a.address == address) {
            addresses.push(MachineAddress { address_type, address });
        }
    }
    if !server.name.is_empty() {
        addresses.push(MachineAddress {
            address_type: AddressType::Hostname,
            address: server.name.clone(),
        });
    }
    addresses
}

impl Reconciler {
    /// Reconciles one CloudMachine.
    pub async fn reconcile_machine(&self, machine: &CloudMachine) -> Result<Action, ControllerError> {
        let result = self.reconcile_machine_locked(machine).await;
        match &result {
            Ok(_) => self.metrics.reconciled("machine", "ok"),
            Err(e) => {
                if let Some(cloud) = e.cloud() {
                    self.note_cloud_error(machine.spec.identity.as_deref(), cloud);
                }
                self.metrics.reconciled("machine", "error");
            }
        }
        result
    }

    async fn reconcile_machine_locked(&self, machine: &CloudMachine) -> Result<Action, ControllerError> {
        let key = object_key(machine);
        let uid = machine
            .uid()
            .ok_or_else(|| ControllerError::InvalidResource(format!("CloudMachine {key} has no uid")))?;

        let _guard = self.locks.lock(&uid).await;

        // The watch event may predate writes made by the reconcile that
        // held the lock before us.
        let namespace = machine.namespace();
        let Some(machine) = self.machines.get(namespace.as_deref(), &machine.name_any()).await? else {
            debug!("CloudMachine {} is gone", key);
            return Ok(Action::await_change());
        };

        let client = self.client_for(machine.spec.identity.as_deref()).await?;

        if is_deleting(&machine) {
            return self.delete_machine(&machine, &uid, client.as_ref()).await;
        }

        let machine = add_finalizer(self.machines.as_ref(), &machine, MACHINE_FINALIZER).await?;

        let recorded = machine
            .status
            .as_ref()
            .and_then(CloudMachineStatus::instance_id)
            .map(str::to_string);
        match recorded {
            None => self.provision_machine(&machine, &uid, client.as_ref()).await,
            Some(id) => self.observe_machine(&machine, &uid, client.as_ref(), &id).await,
        }
    }

    /// Check the recorded server and heal the link if it went stale
    async fn observe_machine(
        &self,
        machine: &CloudMachine,
        uid: &str,
        client: &dyn CloudClientTrait,
        instance_id: &str,
    ) -> Result<Action, ControllerError> {
        let key = object_key(machine);
        match client.get_server(instance_id).await {
            Ok(server) => self.sync_server(machine, client, server, None).await,
            Err(e) if e.is_not_found() => {
                warn!("Server {} of CloudMachine {} no longer exists, clearing instance ID", instance_id, key);
                self.clear_instance(machine, instance_id).await?;
                Ok(Action::requeue(Duration::ZERO))
            }
            Err(e) if e.is_permission_denied() => {
                warn!(
                    "Server {} of CloudMachine {} is not accessible to the active identity, searching by ownership",
                    instance_id, key
                );
                match find_owned_server(client, &machine.name_any(), uid).await? {
                    Some(server) => {
                        info!("Adopting server {} for CloudMachine {}", server.uuid, key);
                        self.sync_server(machine, client, server, Some(instance_id)).await
                    }
                    None => {
                        warn!("No accessible server owned by CloudMachine {}, clearing instance ID", key);
                        self.clear_instance(machine, instance_id).await?;
                        Ok(Action::requeue(Duration::ZERO))
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the server runs and mirror it into the status.
    ///
    /// `stale` is an instance ID being replaced by an adopted server.
    async fn sync_server(
        &self,
        machine: &CloudMachine,
        client: &dyn CloudClientTrait,
        mut server: Server,
        stale: Option<&str>,
    ) -> Result<Action, ControllerError> {
        let key = object_key(machine);
        if server.status == ServerStatus::Stopped {
            info!("Server {} of CloudMachine {} is stopped, starting it", server.uuid, key);
            client.start_server(&server.uuid).await?;
            server.status = ServerStatus::Starting;
        }

        let updated = self
            .update_machine_status(machine, |status| {
                if let Some(stale) = stale
                    && status.instance_id() == Some(stale)
                {
                    status.instance_id = None;
                }
                record_instance(&key, status, &server.uuid)?;
                apply_observed(status, &server);
                Ok(())
            })
            .await?;

        let ready = updated
            .and_then(|m| m.status)
            .is_some_and(|status| status.ready);
        if ready {
            Ok(Action::requeue(self.settings.resync_interval))
        } else {
            Ok(Action::requeue(self.settings.poll_interval))
        }
    }

    /// Forget a server that no longer backs the machine.
    ///
    /// Only clears the ID if it still equals `stale`, so a concurrent
    /// writer that already recorded a replacement is left alone.
    async fn clear_instance(&self, machine: &CloudMachine, stale: &str) -> Result<(), ControllerError> {
        self.update_machine_status(machine, |status| {
            if status.instance_id() == Some(stale) {
                status.instance_id = None;
                status.instance_state = None;
                status.provider_id = None;
                status.ready = false;
                status.addresses.clear();
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_INSTANCE_PROVISIONED,
                        ConditionStatus::False,
                        "InstanceLost",
                        format!("server {stale} is gone or inaccessible"),
                    ),
                );
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn cluster_network(&self, machine: &CloudMachine) -> Result<ClusterNetwork, ControllerError> {
        let Some(cluster_name) = machine.spec.cluster_name.as_deref() else {
            return Ok(ClusterNetwork::Public);
        };
        let namespace = machine.namespace();
        let Some(cluster) = self.clusters.get(namespace.as_deref(), cluster_name).await? else {
            return Ok(ClusterNetwork::Waiting(format!("CloudCluster {cluster_name} not found")));
        };
        match cluster.status.as_ref().filter(|s| s.ready).and_then(|s| s.network_id()) {
            Some(network) => Ok(ClusterNetwork::Ready(network.to_string())),
            None => Ok(ClusterNetwork::Waiting(format!("network of CloudCluster {cluster_name} is not ready"))),
        }
    }

    /// Create the machine's server, unless one already exists
    async fn provision_machine(
        &self,
        machine: &CloudMachine,
        uid: &str,
        client: &dyn CloudClientTrait,
    ) -> Result<Action, ControllerError> {
        let key = object_key(machine);
        let name = machine.name_any();

        if let Some(server) = find_owned_server(client, &name, uid).await? {
            info!("Found existing server {} for CloudMachine {}, adopting", server.uuid, key);
            return self.sync_server(machine, client, server, None).await;
        }

        let network = match self.cluster_network(machine).await? {
            ClusterNetwork::Public => None,
            ClusterNetwork::Ready(network) => Some(network),
            ClusterNetwork::Waiting(reason) => {
                info!("CloudMachine {} waiting for network: {}", key, reason);
                self.update_machine_status(machine, |status| {
                    set_condition(
                        &mut status.conditions,
                        Condition::new(CONDITION_INSTANCE_PROVISIONED, ConditionStatus::False, "WaitingForNetwork", reason.as_str()),
                    );
                    Ok(())
                })
                .await?;
                return Ok(Action::requeue(self.settings.poll_interval));
            }
        };

        let drives = provision::prepare_drives(client, machine, uid, &self.settings).await?;
        let request = provision::server_request(machine, uid, &drives, network.as_deref())?;
        let server = client.create_server(&request).await?;
        info!("Created server {} for CloudMachine {}", server.uuid, key);

        let state = match client.start_server(&server.uuid).await {
            Ok(()) => InstanceState::Starting,
            Err(e) => {
                warn!("Failed to start server {} for CloudMachine {}: {}", server.uuid, key, e);
                InstanceState::Stopped
            }
        };

        self.update_machine_status(machine, |status| {
            record_instance(&key, status, &server.uuid)?;
            status.instance_state = Some(state);
            status.ready = false;
            status.failure_message = None;
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_INSTANCE_PROVISIONED, ConditionStatus::True, "ServerCreated", server.uuid.as_str()),
            );
            Ok(())
        })
        .await?;

        Ok(Action::requeue(self.settings.poll_interval))
    }

    /// Tear down the server and drives, then release the finalizer
    async fn delete_machine(
        &self,
        machine: &CloudMachine,
        uid: &str,
        client: &dyn CloudClientTrait,
    ) -> Result<Action, ControllerError> {
        let key = object_key(machine);
        let name = machine.name_any();
        info!("Deleting CloudMachine {}", key);

        let recorded = machine.status.as_ref().and_then(CloudMachineStatus::instance_id);
        let server = match recorded {
            Some(id) => match client.get_server(id).await {
                Ok(server) => Some(server),
                Err(e) if e.is_not_found() => None,
                Err(e) if e.is_permission_denied() => find_owned_server(client, &name, uid).await?,
                Err(e) => return Err(e.into()),
            },
            None => find_owned_server(client, &name, uid).await?,
        };

        match server {
            Some(server) => self.teardown_server(client, &server).await?,
            None => debug!("No server left for CloudMachine {}", key),
        }

        for drive in find_owned_drives(client, uid).await? {
            match client.delete_drive(&drive.uuid).await {
                Ok(()) => info!("Deleted drive {} of CloudMachine {}", drive.uuid, key),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        remove_finalizer(self.machines.as_ref(), machine, MACHINE_FINALIZER).await?;
        info!("CloudMachine {} cleaned up", key);
        Ok(Action::await_change())
    }

    async fn teardown_server(&self, client: &dyn CloudClientTrait, server: &Server) -> Result<(), ControllerError> {
        if server.status != ServerStatus::Stopped {
            info!("Stopping server {}", server.uuid);
            match client.stop_server(&server.uuid).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            if !self.wait_until_stopped(client, &server.uuid).await? {
                return Ok(());
            }
        }

        match client.delete_server(&server.uuid, true).await {
            Ok(()) => {
                info!("Deleted server {} with its drives", server.uuid);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the server is stopped. `Ok(false)` means it vanished.
    async fn wait_until_stopped(&self, client: &dyn CloudClientTrait, uuid: &str) -> Result<bool, ControllerError> {
        let deadline = Instant::now() + self.settings.clone_timeout;
        loop {
            match client.get_server(uuid).await {
                Ok(server) if server.status == ServerStatus::Stopped => return Ok(true),
                Ok(server) => {
                    if Instant::now() >= deadline {
                        return Err(ControllerError::Timeout(format!(
                            "server {uuid} still {:?} after {:?}",
                            server.status, self.settings.clone_timeout
                        )));
                    }
                }
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            sleep(self.settings.poll_interval).await;
        }
    }
}
