//! CloudCluster CRD
//!
//! The shared network a set of machines join.

use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "infrastructure.cloudsigma.com",
    version = "v1beta1",
    kind = "CloudCluster",
    namespaced,
    status = "CloudClusterStatus",
    shortname = "csc",
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".status.networkId"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudClusterSpec {
    /// CloudSigma region (e.g. "zrh", "fra")
    pub region: String,

    /// CIDR of the private network (recorded on the VLAN)
    pub network_cidr: String,

    /// End-user identity (email) to impersonate against the cloud API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudClusterStatus {
    /// UUID of the VLAN claimed for this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,

    /// True once the network is claimed
    #[serde(default)]
    pub ready: bool,

    /// Observed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CloudClusterStatus {
    /// The claimed network, treating an empty string as unset.
    #[must_use]
    pub fn network_id(&self) -> Option<&str> {
        self.network_id.as_deref().filter(|id| !id.is_empty())
    }
}
