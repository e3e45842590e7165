//! Node health and placement of floating IPs.

use crds::server_uuid_from_provider_id;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

/// A node able to host a floating IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub name: String,
    pub server_uuid: String,
}

/// Ready and not cordoned
pub fn is_healthy(node: &Node) -> bool {
    let cordoned = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    ready && !cordoned
}

/// CloudSigma server behind the node, from `spec.providerID`
pub fn server_uuid(node: &Node) -> Option<&str> {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .and_then(server_uuid_from_provider_id)
}

/// The node as a placement target, if it is healthy and backed by a server
pub fn target(node: &Node) -> Option<NodeTarget> {
    if !is_healthy(node) {
        return None;
    }
    server_uuid(node).map(|uuid| NodeTarget {
        name: node.name_any(),
        server_uuid: uuid.to_string(),
    })
}

/// Lowest-named healthy node other than `exclude`
pub fn pick_node(nodes: &[Node], exclude: Option<&str>) -> Option<NodeTarget> {
    nodes
        .iter()
        .filter(|n| exclude != Some(n.name_any().as_str()))
        .filter_map(target)
        .min_by(|a, b| a.name.cmp(&b.name))
}

/// Name of the node whose server is `server_uuid`
pub fn node_for_server<'a>(nodes: &'a [Node], server_uuid: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| self::server_uuid(n) == Some(server_uuid))
}
