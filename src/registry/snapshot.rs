//! Immutable, versioned registry views.

use std::sync::Arc;

use crate::registry::instance::BackendInstance;

/// Point-in-time membership of the registry.
///
/// Instances are kept sorted by id. A snapshot never changes after it is
/// published; membership changes publish a new one with a higher version.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    instances: Vec<Arc<BackendInstance>>,
}

impl RegistrySnapshot {
    pub fn new(version: u64, mut instances: Vec<Arc<BackendInstance>>) -> Self {
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Self { version, instances }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn instances(&self) -> &[Arc<BackendInstance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BackendInstance>> {
        self.instances
            .binary_search_by(|i| i.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.instances[idx])
    }

    /// Instances the load balancer may pick, in id order.
    pub fn routable(&self) -> impl Iterator<Item = &Arc<BackendInstance>> {
        self.instances.iter().filter(|i| i.is_routable())
    }

    pub fn routable_count(&self) -> usize {
        self.routable().count()
    }

    pub fn total_active_connections(&self) -> usize {
        self.instances.iter().map(|i| i.active_connections()).sum()
    }
}
