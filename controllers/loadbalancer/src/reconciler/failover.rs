//! Node choice and moving an address between servers.

use super::Reconciler;
use crate::binding::ServiceBinding;
use crate::error::ControllerError;
use crate::nodes::{self, NodeTarget, node_for_server, pick_node};
use cloudsigma_client::FloatingIp;
use cloudsigma_client::nic::{attach_ip, detach_ip};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{info, warn};

impl Reconciler {
    /// Node that should host the Service's address.
    ///
    /// A bound Service stays where it is while that node is healthy and
    /// fails over to the lowest-named other healthy node when not. An
    /// unbound Service keeps a healthy node its address is already
    /// attached to.
    pub(crate) fn place(
        &self,
        key: &str,
        previous: Option<&ServiceBinding>,
        attached_server: Option<&str>,
        nodes: &[Node],
    ) -> Option<NodeTarget> {
        if let Some(previous) = previous {
            let current = nodes.iter().find(|n| n.name_any() == previous.node).and_then(nodes::target);
            if current.is_some() {
                return current;
            }
            warn!("Node {} hosting {} for {} is unhealthy, failing over", previous.node, previous.address, key);
            return pick_node(nodes, Some(previous.node.as_str()));
        }

        attached_server
            .and_then(|uuid| node_for_server(nodes, uuid))
            .and_then(nodes::target)
            .or_else(|| pick_node(nodes, None))
    }

    /// Attach `ip` to the target's server, detaching it from any other
    /// server first. The address itself never changes.
    pub(crate) async fn move_address(&self, ip: &FloatingIp, target: &NodeTarget) -> Result<(), ControllerError> {
        if let Some(current) = ip.attached_server()
            && current != target.server_uuid
        {
            info!("Detaching {} from server {}", ip.address(), current);
            detach_ip(self.client.as_ref(), &self.server_locks, current, ip.address()).await?;
        }
        attach_ip(self.client.as_ref(), &self.server_locks, &target.server_uuid, ip.address()).await?;
        Ok(())
    }
}
