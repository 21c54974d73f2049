//! Instance registry subsystem.
//!
//! # Data Flow
//! ```text
//! register / deregister (static config, scaling controller, eviction)
//!     → single writer builds a new RegistrySnapshot (version + 1)
//!     → atomic swap of Arc<RegistrySnapshot>
//!
//! Load balancer / health checker / scaling controller:
//!     → snapshot() (lock-free load)
//!     → per-instance atomics and guarded health trackers
//! ```
//!
//! # Design Decisions
//! - Readers never block on membership changes
//! - No registry-wide lock on the request path; counters are per instance
//! - Unknown ids are reported, never fatal; callers drop the reference

pub mod instance;
pub mod snapshot;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::health::state::{HealthPolicy, Outcome, Transition};
use crate::observability::metrics;
use crate::resilience::{CircuitPolicy, CircuitState, CircuitTransition};

pub use instance::{
    BackendInstance, ConnectionGuard, InstanceDescriptor, InstanceId, InstanceOrigin, InstanceStatus,
};
pub use snapshot::RegistrySnapshot;

/// Errors returned by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance '{0}' is not registered")]
    NotFound(InstanceId),
}

/// Authoritative set of backend instances.
pub struct InstanceRegistry {
    current: ArcSwap<RegistrySnapshot>,
    /// Serializes membership changes.
    writer: Mutex<()>,
    policy: ArcSwap<HealthPolicy>,
    circuit: ArcSwap<CircuitPolicy>,
}

impl InstanceRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
            policy: ArcSwap::from_pointee(policy),
            circuit: ArcSwap::from_pointee(CircuitPolicy::default()),
        }
    }

    /// Current membership view. Never blocks.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn get(&self, id: &str) -> Result<Arc<BackendInstance>, RegistryError> {
        self.current
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn health_policy(&self) -> HealthPolicy {
        **self.policy.load()
    }

    /// Replace the health thresholds used for subsequent results.
    pub fn set_health_policy(&self, policy: HealthPolicy) {
        self.policy.store(Arc::new(policy));
    }

    pub fn circuit_policy(&self) -> CircuitPolicy {
        **self.circuit.load()
    }

    /// Replace the circuit breaker policy used for subsequent outcomes.
    /// Disabling the breaker closes every open circuit.
    pub fn set_circuit_policy(&self, policy: CircuitPolicy) {
        self.circuit.store(Arc::new(policy));
        if !policy.enabled {
            for instance in self.snapshot().instances() {
                log_circuit_transition(instance, instance.circuit().reset());
            }
        }
    }

    /// Add an instance. An existing record with the same id is replaced.
    pub fn register(&self, descriptor: InstanceDescriptor, origin: InstanceOrigin) -> Arc<BackendInstance> {
        let instance = Arc::new(BackendInstance::new(descriptor, origin, &self.policy.load()));
        let added = instance.clone();
        self.publish(|instances| {
            instances.retain(|i| i.id != added.id);
            instances.push(added);
            true
        });
        tracing::info!(
            instance = %instance.id,
            addr = %instance.addr,
            origin = ?origin,
            state = %instance.health_state(),
            "Instance registered"
        );
        metrics::record_instance_health(&instance.id, instance.health_state());
        instance
    }

    /// Remove an instance. In-flight requests keep their handle until they finish.
    pub fn deregister(&self, id: &str) -> Result<Arc<BackendInstance>, RegistryError> {
        let mut removed = None;
        self.publish(|instances| {
            if let Some(pos) = instances.iter().position(|i| i.id == id) {
                removed = Some(instances.remove(pos));
                true
            } else {
                false
            }
        });

        match removed {
            Some(instance) => {
                tracing::info!(
                    instance = %instance.id,
                    active_connections = instance.active_connections(),
                    "Instance deregistered"
                );
                metrics::forget_instance(&instance.id);
                Ok(instance)
            }
            None => {
                tracing::debug!(instance = %id, "Deregister for unknown instance");
                Err(RegistryError::NotFound(id.to_string()))
            }
        }
    }

    /// Bring the static part of the pool in line with `desired`.
    ///
    /// Discovered instances are left alone. Returns (added, removed) counts.
    pub fn reconcile_static(&self, desired: &[InstanceDescriptor]) -> (usize, usize) {
        let policy = self.policy.load_full();
        let mut added = 0;
        let mut removed = 0;
        self.publish(|instances| {
            let before = instances.len();
            instances.retain(|i| {
                i.origin != InstanceOrigin::Static
                    || desired.iter().any(|d| *d == i.descriptor())
            });
            removed = before - instances.len();

            for descriptor in desired {
                if instances.iter().any(|i| i.id == descriptor.id) {
                    continue;
                }
                instances.push(Arc::new(BackendInstance::new(
                    descriptor.clone(),
                    InstanceOrigin::Static,
                    &policy,
                )));
                added += 1;
            }
            added > 0 || removed > 0
        });

        if added > 0 || removed > 0 {
            tracing::info!(added, removed, "Static backends reconciled");
        }
        (added, removed)
    }

    /// Record the outcome of a proxied request (passive health signal and
    /// circuit breaker input).
    pub fn report_outcome(&self, id: &str, outcome: Outcome) -> Result<Option<Transition>, RegistryError> {
        let instance = self.get(id)?;
        instance.record_request(outcome);
        metrics::record_instance_request(&instance.id, outcome);
        let transition = instance.record_health(outcome, &self.policy.load(), None);
        log_transition(&instance, transition, "passive");
        let circuit = instance.circuit().record(outcome, &self.circuit.load(), Instant::now());
        log_circuit_transition(&instance, circuit);
        Ok(transition)
    }

    /// Record the result of an active health probe.
    pub fn mark_probe_result(&self, id: &str, outcome: Outcome) -> Result<Option<Transition>, RegistryError> {
        let instance = self.get(id)?;
        let transition = instance.record_health(outcome, &self.policy.load(), Some(Instant::now()));
        log_transition(&instance, transition, "probe");
        Ok(transition)
    }

    pub fn increment_active(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self.get(id)?;
        instance.inc_connections();
        metrics::set_active_connections(&instance.id, instance.active_connections());
        Ok(())
    }

    pub fn decrement_active(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self.get(id)?;
        instance.dec_connections();
        metrics::set_active_connections(&instance.id, instance.active_connections());
        Ok(())
    }

    /// Apply `change` to a copy of the membership and publish it if it reports a change.
    fn publish<F>(&self, change: F)
    where
        F: FnOnce(&mut Vec<Arc<BackendInstance>>) -> bool,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let mut instances = current.instances().to_vec();
        if change(&mut instances) {
            let version = current.version() + 1;
            self.current.store(Arc::new(RegistrySnapshot::new(version, instances)));
            metrics::set_registry_version(version);
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

fn log_transition(instance: &BackendInstance, transition: Option<Transition>, source: &'static str) {
    let Some(t) = transition else { return };
    metrics::record_instance_health(&instance.id, t.to);
    if t.to > t.from {
        tracing::warn!(instance = %instance.id, from = %t.from, to = %t.to, source, "Instance health degraded");
    } else {
        tracing::info!(instance = %instance.id, from = %t.from, to = %t.to, source, "Instance health improved");
    }
}

pub(crate) fn log_circuit_transition(instance: &BackendInstance, transition: Option<CircuitTransition>) {
    let Some(t) = transition else { return };
    metrics::record_circuit_transition(t.to);
    match t.to {
        CircuitState::Open => {
            tracing::warn!(instance = %instance.id, from = %t.from, "Circuit opened, instance out of rotation")
        }
        CircuitState::HalfOpen => tracing::info!(instance = %instance.id, "Circuit half-open, sending trial requests"),
        CircuitState::Closed => tracing::info!(instance = %instance.id, from = %t.from, "Circuit closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitialHealth;
    use crate::health::state::HealthState;

    fn descriptor(id: &str, port: u16) -> InstanceDescriptor {
        InstanceDescriptor {
            id: id.to_string(),
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
            weight: 1,
        }
    }

    #[test]
    fn test_register_bumps_version() {
        let registry = InstanceRegistry::default();
        assert_eq!(registry.version(), 0);

        registry.register(descriptor("b", 8081), InstanceOrigin::Static);
        registry.register(descriptor("a", 8080), InstanceOrigin::Static);
        assert_eq!(registry.version(), 2);

        let snap = registry.snapshot();
        let ids: Vec<_> = snap.instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let registry = InstanceRegistry::default();
        registry.register(descriptor("a", 8080), InstanceOrigin::Static);

        let err = registry.deregister("zzz").unwrap_err();
        assert_eq!(err, RegistryError::NotFound("zzz".into()));
        assert_eq!(registry.version(), 1, "failed deregister must not bump version");
        assert!(registry.report_outcome("zzz", Outcome::Success).is_err());
        assert!(registry.increment_active("zzz").is_err());
    }

    #[test]
    fn test_snapshot_is_isolated_from_mutation() {
        let registry = InstanceRegistry::default();
        registry.register(descriptor("a", 8080), InstanceOrigin::Static);
        registry.register(descriptor("b", 8081), InstanceOrigin::Static);

        let before = registry.snapshot();
        registry.deregister("a").unwrap();
        registry.register(descriptor("c", 8082), InstanceOrigin::Discovered);

        assert_eq!(before.len(), 2);
        assert!(before.get("a").is_some());
        let after = registry.snapshot();
        assert_eq!(after.version(), before.version() + 2);
        assert!(after.get("a").is_none());
        assert!(after.get("c").is_some());
    }

    #[test]
    fn test_active_counters() {
        let registry = InstanceRegistry::default();
        registry.register(descriptor("a", 8080), InstanceOrigin::Static);

        registry.increment_active("a").unwrap();
        registry.increment_active("a").unwrap();
        registry.decrement_active("a").unwrap();
        assert_eq!(registry.get("a").unwrap().active_connections(), 1);
    }

    #[test]
    fn test_probe_results_drive_state() {
        let registry = InstanceRegistry::default();
        registry.set_health_policy(HealthPolicy {
            failure_threshold: 3,
            success_threshold: 3,
            initial_state: InitialHealth::Healthy,
        });
        registry.register(descriptor("a", 8080), InstanceOrigin::Static);

        for _ in 0..3 {
            registry.mark_probe_result("a", Outcome::Failure).unwrap();
        }
        let a = registry.get("a").unwrap();
        assert_eq!(a.health_state(), HealthState::Unhealthy);
        assert_eq!(registry.snapshot().routable_count(), 0);

        for _ in 0..3 {
            registry.mark_probe_result("a", Outcome::Success).unwrap();
        }
        assert_eq!(a.health_state(), HealthState::Healthy);
    }

    #[test]
    fn test_pessimistic_registration() {
        let registry = InstanceRegistry::new(HealthPolicy {
            failure_threshold: 3,
            success_threshold: 2,
            initial_state: InitialHealth::Suspect,
        });
        let a = registry.register(descriptor("a", 8080), InstanceOrigin::Discovered);
        assert_eq!(a.health_state(), HealthState::Suspect);
        assert!(!a.is_routable());
    }

    #[test]
    fn test_reconcile_static_keeps_discovered() {
        let registry = InstanceRegistry::default();
        registry.register(descriptor("s1", 8080), InstanceOrigin::Static);
        registry.register(descriptor("s2", 8081), InstanceOrigin::Static);
        registry.register(descriptor("d1", 9000), InstanceOrigin::Discovered);

        let (added, removed) = registry.reconcile_static(&[descriptor("s2", 8081), descriptor("s3", 8082)]);
        assert_eq!((added, removed), (1, 1));

        let snap = registry.snapshot();
        let ids: Vec<_> = snap.instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "s2", "s3"]);

        let version = registry.version();
        assert_eq!(registry.reconcile_static(&[descriptor("s2", 8081), descriptor("s3", 8082)]), (0, 0));
        assert_eq!(registry.version(), version);
    }

    #[test]
    fn test_request_failures_open_circuit() {
        let registry = InstanceRegistry::new(HealthPolicy {
            failure_threshold: 10,
            success_threshold: 1,
            initial_state: InitialHealth::Healthy,
        });
        registry.set_circuit_policy(CircuitPolicy {
            enabled: true,
            failure_threshold: 2,
            recovery_timeout: std::time::Duration::from_secs(30),
            half_open_max_requests: 1,
        });
        let a = registry.register(descriptor("a", 8080), InstanceOrigin::Static);

        registry.report_outcome("a", Outcome::Failure).unwrap();
        assert_eq!(a.circuit().state(), CircuitState::Closed);
        registry.report_outcome("a", Outcome::Failure).unwrap();
        assert_eq!(a.circuit().state(), CircuitState::Open);
        // Health alone would still route it.
        assert!(a.is_routable());
        assert_eq!(a.status().circuit, CircuitState::Open);

        // Health checks do not feed the breaker.
        registry.mark_probe_result("a", Outcome::Success).unwrap();
        assert_eq!(a.circuit().state(), CircuitState::Open);

        registry.set_circuit_policy(CircuitPolicy {
            enabled: false,
            ..registry.circuit_policy()
        });
        assert_eq!(a.circuit().state(), CircuitState::Closed);
    }
}
