//! In-memory ServiceBinding registry.
//!
//! The registry is a cache of what the tags and Service status already
//! record; it is rebuilt from them at startup and never consulted as the
//! only source of truth for an address.

use crate::error::ControllerError;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One Service holding one floating IP on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    /// `namespace/name`
    pub service: String,
    pub address: String,
    /// Node hosting the address
    pub node: String,
    /// CloudSigma server of that node
    pub server_uuid: String,
    /// Name of the forwarding unit on that node
    pub unit: String,
}

#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: Mutex<BTreeMap<String, ServiceBinding>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ServiceBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, service: &str) -> Option<ServiceBinding> {
        self.lock().get(service).cloned()
    }

    /// Record `binding`, replacing the Service's previous one.
    ///
    /// Refuses an address another Service already holds.
    pub fn insert(&self, binding: ServiceBinding) -> Result<(), ControllerError> {
        let mut bindings = self.lock();
        if let Some(holder) = bindings
            .values()
            .find(|b| b.address == binding.address && b.service != binding.service)
        {
            return Err(ControllerError::Conflict(format!(
                "{} is bound to {}, not {}",
                binding.address, holder.service, binding.service
            )));
        }
        bindings.insert(binding.service.clone(), binding);
        Ok(())
    }

    pub fn remove(&self, service: &str) -> Option<ServiceBinding> {
        self.lock().remove(service)
    }

    /// Every binding, ordered by Service key
    pub fn all(&self) -> Vec<ServiceBinding> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Services whose address is hosted on `node`
    pub fn services_on(&self, node: &str) -> Vec<String> {
        self.lock()
            .values()
            .filter(|b| b.node == node)
            .map(|b| b.service.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(service: &str, address: &str, node: &str) -> ServiceBinding {
        ServiceBinding {
            service: service.to_string(),
            address: address.to_string(),
            node: node.to_string(),
            server_uuid: format!("srv-{node}"),
            unit: format!("fip-{node}"),
        }
    }

    #[test]
    fn test_one_address_per_service() {
        let registry = BindingRegistry::new();
        registry.insert(binding("default/a", "203.0.113.1", "n1")).unwrap();

        let err = registry.insert(binding("default/b", "203.0.113.1", "n1")).unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));

        // Rebinding the same Service to another node replaces it
        registry.insert(binding("default/a", "203.0.113.1", "n2")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("default/a").unwrap().node, "n2");
    }

    #[test]
    fn test_services_on_node() {
        let registry = BindingRegistry::new();
        registry.insert(binding("default/a", "203.0.113.1", "n1")).unwrap();
        registry.insert(binding("default/b", "203.0.113.2", "n2")).unwrap();
        registry.insert(binding("web/c", "203.0.113.3", "n1")).unwrap();

        assert_eq!(registry.services_on("n1"), vec!["default/a", "web/c"]);
        assert!(registry.services_on("n3").is_empty());

        registry.remove("default/a");
        assert_eq!(registry.services_on("n1"), vec!["web/c"]);
    }
}
