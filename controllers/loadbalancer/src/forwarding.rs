//! Node-local forwarding units.
//!
//! A unit realizes one floating IP on one node: it adds the address as an
//! alias on the node's primary interface and installs DNAT/SNAT rules to
//! the Service's backend. Units run as long-lived pods pinned to the node
//! with host networking, so the rules live exactly as long as the pod and
//! are removed when it receives SIGTERM.

use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, Pod, PodSpec, SecurityContext, Toleration,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Label marking every forwarding pod
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGER: &str = "cloudsigma-lb-controller";
/// Label holding the address (dashed) a pod forwards
pub const ADDRESS_LABEL: &str = "cloudsigma.com/floating-ip";
/// Annotation holding the owning Service (`namespace/name`)
pub const SERVICE_ANNOTATION: &str = "cloudsigma.com/service";
/// Annotation holding the forwarding signature
pub const SIGNATURE_ANNOTATION: &str = "cloudsigma.com/forwarding";

/// Kubernetes names are limited to 63 characters in labels and DNS labels
const MAX_NAME_LEN: usize = 63;

/// Transport protocol of a forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Protocol of a Service port; `None` for anything but TCP and UDP
    pub fn from_service(protocol: Option<&str>) -> Option<Self> {
        match protocol.unwrap_or("TCP") {
            "TCP" => Some(Self::Tcp),
            "UDP" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// What one unit forwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingSpec {
    /// Floating IP
    pub address: String,
    /// Node hosting the address
    pub node: String,
    pub protocol: Protocol,
    /// Port on the floating IP
    pub port: u16,
    /// Backend address (endpoint or cluster IP)
    pub target_ip: String,
    pub target_port: u16,
}

/// Hex digits of the node digest appended to shortened names
const DIGEST_LEN: usize = 8;

/// Name of the unit hosting `address` on `node`.
///
/// Names that do not fit are cut and suffixed with a digest of the full
/// node name, so nodes sharing a long prefix still get distinct units.
pub fn unit_name(address: &str, node: &str) -> String {
    let name = format!("fip-{}-{}", address.replace(['.', ':'], "-"), node);
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let digest: String = Sha256::digest(node.as_bytes())
        .iter()
        .take(DIGEST_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    let prefix = name
        .get(..MAX_NAME_LEN - DIGEST_LEN - 1)
        .unwrap_or(&name)
        .trim_end_matches(['-', '.']);
    format!("{prefix}-{digest}")
}

/// Whether `unit` already forwards `spec` for `service` on the right node
pub fn is_current(unit: &ForwardingUnit, spec: &ForwardingSpec, service: &str) -> bool {
    unit.node == spec.node && unit.service == service && unit.signature == spec.signature()
}

impl ForwardingSpec {
    pub fn unit_name(&self) -> String {
        unit_name(&self.address, &self.node)
    }

    /// Compact description of the rules; a changed signature means the
    /// unit must be replaced
    pub fn signature(&self) -> String {
        format!(
            "{}:{}/{}@{}->{}:{}",
            self.address, self.port, self.protocol, self.node, self.target_ip, self.target_port
        )
    }

    /// Shell script run by the unit
    pub fn script(&self) -> String {
        format!(
            r#"set -eu
ADDR={address}
command -v iptables >/dev/null 2>&1 || apk add --no-cache iptables >/dev/null
DEV=$(ip -4 route show default | awk '{{print $5; exit}}')
DNAT="PREROUTING -d $ADDR/32 -p {proto} --dport {port} -j DNAT --to-destination {target}:{target_port}"
SNAT="POSTROUTING -d {target}/32 -p {proto} --dport {target_port} -m conntrack --ctorigdst $ADDR/32 -j MASQUERADE"
cleanup() {{
  iptables -t nat -D $DNAT 2>/dev/null || true
  iptables -t nat -D $SNAT 2>/dev/null || true
  ip addr del "$ADDR/32" dev "$DEV" 2>/dev/null || true
  exit 0
}}
trap cleanup TERM INT
ip addr add "$ADDR/32" dev "$DEV" 2>/dev/null || true
iptables -t nat -C $DNAT 2>/dev/null || iptables -t nat -A $DNAT
iptables -t nat -C $SNAT 2>/dev/null || iptables -t nat -A $SNAT
echo "forwarding $ADDR:{port}/{proto} to {target}:{target_port} via $DEV"
while true; do sleep 3600 & wait $!; done
"#,
            address = self.address,
            proto = self.protocol,
            port = self.port,
            target = self.target_ip,
            target_port = self.target_port,
        )
    }
}

/// A unit as found on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingUnit {
    pub name: String,
    pub node: String,
    /// Owning Service (`namespace/name`)
    pub service: String,
    pub signature: String,
}

/// Creates, lists and removes forwarding units
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Make the unit for `spec` exist with exactly these rules
    async fn ensure(&self, spec: &ForwardingSpec, service: &str) -> Result<(), ControllerError>;

    /// Remove a unit; a missing unit is not an error
    async fn remove(&self, name: &str) -> Result<(), ControllerError>;

    /// Every unit this controller manages
    async fn list(&self) -> Result<Vec<ForwardingUnit>, ControllerError>;
}

/// Pod manifest for a unit
pub fn forwarder_pod(spec: &ForwardingSpec, service: &str, namespace: &str, image: &str) -> Pod {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGER.to_string()),
        (ADDRESS_LABEL.to_string(), spec.address.replace(['.', ':'], "-")),
    ]);
    let annotations = BTreeMap::from([
        (SERVICE_ANNOTATION.to_string(), service.to_string()),
        (SIGNATURE_ANNOTATION.to_string(), spec.signature()),
    ]);

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.unit_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(spec.node.clone()),
            host_network: Some(true),
            restart_policy: Some("Always".to_string()),
            termination_grace_period_seconds: Some(10),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            }]),
            containers: vec![Container {
                name: "forwarder".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), spec.script()]),
                security_context: Some(SecurityContext {
                    capabilities: Some(Capabilities {
                        add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                        ..Capabilities::default()
                    }),
                    ..SecurityContext::default()
                }),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        status: None,
    }
}

fn unit_from_pod(pod: &Pod) -> Option<ForwardingUnit> {
    let annotations = pod.metadata.annotations.as_ref()?;
    Some(ForwardingUnit {
        name: pod.name_any(),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default(),
        service: annotations.get(SERVICE_ANNOTATION)?.clone(),
        signature: annotations.get(SIGNATURE_ANNOTATION).cloned().unwrap_or_default(),
    })
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == code)
}

/// Forwarding units as pods in one namespace
#[derive(Clone)]
pub struct PodForwarder {
    pods: Api<Pod>,
    namespace: String,
    image: String,
}

impl PodForwarder {
    pub fn new(client: kube::Client, namespace: &str, image: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            image: image.to_string(),
        }
    }
}

#[async_trait]
impl Forwarder for PodForwarder {
    async fn ensure(&self, spec: &ForwardingSpec, service: &str) -> Result<(), ControllerError> {
        let name = spec.unit_name();
        if let Some(existing) = self.pods.get_opt(&name).await? {
            let current = unit_from_pod(&existing);
            let terminating = existing.metadata.deletion_timestamp.is_some();
            if !terminating && current.is_some_and(|u| is_current(&u, spec, service)) {
                debug!("Forwarding unit {} is current", name);
                return Ok(());
            }
            if terminating {
                // The old pod still holds the name; retry once it is gone
                return Err(ControllerError::Conflict(format!("forwarding unit {name} is terminating")));
            }
            info!("Replacing forwarding unit {} with {}", name, spec.signature());
            self.remove(&name).await?;
            return Err(ControllerError::Conflict(format!("forwarding unit {name} is being replaced")));
        }

        let pod = forwarder_pod(spec, service, &self.namespace, &self.image);
        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!("Created forwarding unit {} on node {}", name, spec.node);
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                debug!("Forwarding unit {} created concurrently", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), ControllerError> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Removed forwarding unit {}", name);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => {
                warn!("Failed to remove forwarding unit {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    async fn list(&self) -> Result<Vec<ForwardingUnit>, ControllerError> {
        let params = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGER}"));
        let pods = self.pods.list(&params).await?;
        Ok(pods
            .items
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter_map(unit_from_pod)
            .collect())
    }
}
