//! Backend instance record.
//!
//! # Responsibilities
//! - Represent a single backend process
//! - Track active connections (for Least Connections LB)
//! - Track request counters, health state and the request circuit
//! - Hand out connection guards that release exactly once

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::health::state::{HealthPolicy, HealthState, HealthTracker, Outcome, Transition};
use crate::observability::metrics;
use crate::resilience::{CircuitBreaker, CircuitState};

/// Stable, unique instance identifier.
pub type InstanceId = String;

/// Where an instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceOrigin {
    /// Listed in the `[[backends]]` section of the config file.
    Static,
    /// Reported by the orchestrator.
    Discovered,
}

/// Wire description of an instance, as exchanged with the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: InstanceId,
    pub address: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A single backend instance.
#[derive(Debug)]
pub struct BackendInstance {
    pub id: InstanceId,
    pub addr: SocketAddr,
    /// Weight for weighted load balancing.
    pub weight: u32,
    pub origin: InstanceOrigin,
    pub registered_at: Instant,

    active_connections: AtomicUsize,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,

    /// Lock-free mirrors of the tracker, read on the selection path.
    state: AtomicU8,
    routable: AtomicBool,
    health: Mutex<HealthTracker>,
    circuit: CircuitBreaker,
}

impl BackendInstance {
    pub fn new(descriptor: InstanceDescriptor, origin: InstanceOrigin, policy: &HealthPolicy) -> Self {
        let tracker = HealthTracker::new(policy.initial_state);
        Self {
            id: descriptor.id,
            addr: descriptor.address,
            weight: descriptor.weight,
            origin,
            registered_at: Instant::now(),
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            state: AtomicU8::new(tracker.state() as u8),
            routable: AtomicBool::new(tracker.is_routable()),
            health: Mutex::new(tracker),
            circuit: CircuitBreaker::new(),
        }
    }

    pub fn descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor {
            id: self.id.clone(),
            address: self.addr,
            weight: self.weight,
        }
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Increment active connection count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connection count, never going below zero.
    pub fn dec_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Count a new in-flight request and return a guard that releases it on drop.
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.inc_connections();
        metrics::set_active_connections(&self.id, self.active_connections());
        ConnectionGuard {
            instance: self.clone(),
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn record_request(&self, outcome: Outcome) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if outcome == Outcome::Failure {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    // --- Health Logic ---

    pub fn health_state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Return true if the load balancer may select this instance.
    pub fn is_routable(&self) -> bool {
        self.routable.load(Ordering::Acquire)
    }

    /// Feed a probe or request result into the state machine.
    pub fn record_health(&self, outcome: Outcome, policy: &HealthPolicy, probed_at: Option<Instant>) -> Option<Transition> {
        let now = probed_at.unwrap_or_else(Instant::now);
        let mut tracker = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if probed_at.is_some() {
            tracker.mark_probed(now);
        }
        let transition = tracker.record(outcome, policy, now);
        if transition.is_some() {
            self.state.store(tracker.state() as u8, Ordering::Release);
            self.routable.store(tracker.is_routable(), Ordering::Release);
        }
        transition
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// How long the instance has been unhealthy, if it is.
    pub fn unhealthy_for(&self, now: Instant) -> Option<Duration> {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unhealthy_for(now)
    }

    /// Consistent point-in-time view of this instance.
    pub fn status(&self) -> InstanceStatus {
        let tracker = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        InstanceStatus {
            id: self.id.clone(),
            address: self.addr,
            weight: self.weight,
            origin: self.origin,
            state: tracker.state(),
            routable: tracker.is_routable(),
            circuit: self.circuit.state(),
            active_connections: self.active_connections(),
            total_requests: self.total_requests(),
            failed_requests: self.failed_requests(),
            consecutive_failures: tracker.consecutive_failures(),
            consecutive_successes: tracker.consecutive_successes(),
            last_probe_ms_ago: tracker
                .last_probe()
                .map(|at| at.elapsed().as_millis() as u64),
            uptime_secs: self.registered_at.elapsed().as_secs(),
        }
    }
}

/// Serializable view of an instance for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub address: SocketAddr,
    pub weight: u32,
    pub origin: InstanceOrigin,
    pub state: HealthState,
    pub routable: bool,
    pub circuit: CircuitState,
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_ms_ago: Option<u64>,
    pub uptime_secs: u64,
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct ConnectionGuard {
    instance: Arc<BackendInstance>,
}

impl ConnectionGuard {
    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }
}

impl Deref for ConnectionGuard {
    type Target = BackendInstance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.dec_connections();
        metrics::set_active_connections(&self.instance.id, self.instance.active_connections());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, port: u16) -> Arc<BackendInstance> {
        let descriptor = InstanceDescriptor {
            id: id.to_string(),
            address: format!("127.0.0.1:{}", port).parse().unwrap(),
            weight: 1,
        };
        Arc::new(BackendInstance::new(descriptor, InstanceOrigin::Static, &HealthPolicy::default()))
    }

    #[test]
    fn test_guard_releases_once() {
        let b = instance("a", 8080);
        let g1 = b.connection_guard();
        let g2 = b.connection_guard();
        assert_eq!(b.active_connections(), 2);
        assert_eq!(g1.id, "a");

        drop(g1);
        assert_eq!(b.active_connections(), 1);
        drop(g2);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn test_active_count_never_negative() {
        let b = instance("a", 8080);
        b.dec_connections();
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn test_status_reflects_counters() {
        let b = instance("a", 8080);
        b.record_request(Outcome::Success);
        b.record_request(Outcome::Failure);
        let policy = HealthPolicy::default();
        b.record_health(Outcome::Failure, &policy, Some(Instant::now()));

        let status = b.status();
        assert_eq!(status.total_requests, 2);
        assert_eq!(status.failed_requests, 1);
        assert_eq!(status.state, HealthState::Suspect);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_probe_ms_ago.is_some());
        assert_eq!(b.health_state(), HealthState::Suspect);
    }
}
