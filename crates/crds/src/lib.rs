//! CloudSigma infrastructure CRD definitions
//!
//! Kubernetes Custom Resource Definitions reconciled by the machine controller:
//! - `CloudMachine`: one compute instance (server + drives) on CloudSigma
//! - `CloudCluster`: the shared VLAN the machines of a cluster join

pub mod cloud_cluster;
pub mod cloud_machine;
pub mod conditions;

pub use cloud_cluster::*;
pub use cloud_machine::*;
pub use conditions::*;

/// API group shared by all infrastructure CRDs
pub const API_GROUP: &str = "infrastructure.cloudsigma.com";

/// Finalizer guarding server and drive teardown for a `CloudMachine`
pub const MACHINE_FINALIZER: &str = "cloudmachine.infrastructure.cloudsigma.com/finalizer";

/// Finalizer guarding network release for a `CloudCluster`
pub const CLUSTER_FINALIZER: &str = "cloudcluster.infrastructure.cloudsigma.com/finalizer";

/// Scheme prefix of `status.providerId`
pub const PROVIDER_ID_PREFIX: &str = "cloudsigma://";

/// Build the provider ID for a server UUID.
#[must_use]
pub fn provider_id(server_uuid: &str) -> String {
    format!("{PROVIDER_ID_PREFIX}{server_uuid}")
}

/// Extract the server UUID from a provider ID (`cloudsigma://<uuid>`).
///
/// Returns `None` for provider IDs of other clouds or empty UUIDs.
#[must_use]
pub fn server_uuid_from_provider_id(provider_id: &str) -> Option<&str> {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .filter(|uuid| !uuid.is_empty())
}
