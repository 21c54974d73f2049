//! Instance health state machine.
//!
//! # States
//! - Healthy: instance receives traffic
//! - Suspect: instance is under observation
//! - Unhealthy: instance excluded from load balancing
//!
//! # State Transitions
//! ```text
//! Healthy   → Suspect:   first failure
//! Suspect   → Unhealthy: consecutive failures >= failure_threshold
//! Unhealthy → Suspect:   first success
//! Suspect   → Healthy:   consecutive successes >= success_threshold
//! ```
//!
//! A result moves the machine at most one step. The streak counters are not
//! reset when the machine enters `Suspect`, so `failure_threshold` consecutive
//! failures take a healthy instance all the way to `Unhealthy`.
//!
//! A `Suspect` instance keeps serving when its last settled state was
//! `Healthy`; one recovering from `Unhealthy` stays out of rotation until it
//! settles back to `Healthy`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{HealthCheckConfig, InitialHealth};

/// Health state of a backend instance, ordered from best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy = 0,
    Suspect = 1,
    Unhealthy = 2,
}

impl HealthState {
    /// Gauge value exported for this state (higher is healthier).
    pub fn gauge_value(self) -> f64 {
        match self {
            HealthState::Healthy => 2.0,
            HealthState::Suspect => 1.0,
            HealthState::Unhealthy => 0.0,
        }
    }
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            0 => HealthState::Healthy,
            1 => HealthState::Suspect,
            _ => HealthState::Unhealthy,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Suspect => write!(f, "suspect"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a probe or a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Thresholds driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub initial_state: InitialHealth,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthCheckConfig::default())
    }
}

impl From<&HealthCheckConfig> for HealthPolicy {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            initial_state: config.initial_state,
        }
    }
}

/// A state change produced by a single result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Per-instance health bookkeeping.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    /// Last non-suspect state the machine rested in.
    settled: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_since: Option<Instant>,
    last_probe: Option<Instant>,
}

impl HealthTracker {
    pub fn new(initial: InitialHealth) -> Self {
        let (state, settled) = match initial {
            InitialHealth::Healthy => (HealthState::Healthy, HealthState::Healthy),
            InitialHealth::Suspect => (HealthState::Suspect, HealthState::Unhealthy),
        };
        Self {
            state,
            settled,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_since: None,
            last_probe: None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn last_probe(&self) -> Option<Instant> {
        self.last_probe
    }

    pub fn mark_probed(&mut self, at: Instant) {
        self.last_probe = Some(at);
    }

    /// Whether the load balancer may pick this instance.
    pub fn is_routable(&self) -> bool {
        match self.state {
            HealthState::Healthy => true,
            HealthState::Suspect => self.settled == HealthState::Healthy,
            HealthState::Unhealthy => false,
        }
    }

    /// How long the instance has been unhealthy, if it is.
    pub fn unhealthy_for(&self, now: Instant) -> Option<Duration> {
        self.unhealthy_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Feed one result into the machine.
    pub fn record(&mut self, outcome: Outcome, policy: &HealthPolicy, now: Instant) -> Option<Transition> {
        let from = self.state;
        let to = match outcome {
            Outcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                match from {
                    HealthState::Healthy => HealthState::Suspect,
                    HealthState::Suspect if self.consecutive_failures >= policy.failure_threshold => {
                        HealthState::Unhealthy
                    }
                    other => other,
                }
            }
            Outcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                match from {
                    HealthState::Unhealthy => HealthState::Suspect,
                    HealthState::Suspect if self.consecutive_successes >= policy.success_threshold => {
                        HealthState::Healthy
                    }
                    other => other,
                }
            }
        };

        if to == from {
            return None;
        }

        self.state = to;
        match to {
            HealthState::Healthy => {
                self.settled = HealthState::Healthy;
            }
            HealthState::Unhealthy => {
                self.settled = HealthState::Unhealthy;
                self.unhealthy_since = Some(now);
            }
            HealthState::Suspect => {
                self.unhealthy_since = None;
            }
        }

        Some(Transition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(failures: u32, successes: u32) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: failures,
            success_threshold: successes,
            initial_state: InitialHealth::Healthy,
        }
    }

    #[test]
    fn test_three_failures_reach_unhealthy() {
        let policy = policy(3, 3);
        let now = Instant::now();
        let mut tracker = HealthTracker::new(InitialHealth::Healthy);

        let t1 = tracker.record(Outcome::Failure, &policy, now);
        assert_eq!(t1, Some(Transition { from: HealthState::Healthy, to: HealthState::Suspect }));
        assert!(tracker.is_routable());

        assert_eq!(tracker.record(Outcome::Failure, &policy, now), None);
        let t3 = tracker.record(Outcome::Failure, &policy, now);
        assert_eq!(t3, Some(Transition { from: HealthState::Suspect, to: HealthState::Unhealthy }));
        assert!(!tracker.is_routable());
        assert_eq!(tracker.unhealthy_for(now), Some(Duration::ZERO));
    }

    #[test]
    fn test_three_successes_restore_healthy() {
        let policy = policy(3, 3);
        let now = Instant::now();
        let mut tracker = HealthTracker::new(InitialHealth::Healthy);
        for _ in 0..3 {
            tracker.record(Outcome::Failure, &policy, now);
        }
        assert_eq!(tracker.state(), HealthState::Unhealthy);

        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Suspect);
        assert!(!tracker.is_routable(), "recovering instance stays out of rotation");
        assert_eq!(tracker.unhealthy_for(now), None);

        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Suspect);
        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Healthy);
        assert!(tracker.is_routable());
    }

    #[test]
    fn test_intermittent_failures_do_not_flap() {
        let policy = policy(3, 3);
        let now = Instant::now();
        let mut tracker = HealthTracker::new(InitialHealth::Healthy);

        for _ in 0..10 {
            tracker.record(Outcome::Failure, &policy, now);
            tracker.record(Outcome::Success, &policy, now);
        }
        assert_eq!(tracker.state(), HealthState::Suspect);
        assert!(tracker.is_routable());
        assert_eq!(tracker.consecutive_successes(), 1);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn test_never_jumps_two_states() {
        let policy = policy(1, 1);
        let now = Instant::now();
        let mut tracker = HealthTracker::new(InitialHealth::Healthy);

        tracker.record(Outcome::Failure, &policy, now);
        assert_eq!(tracker.state(), HealthState::Suspect);
        tracker.record(Outcome::Failure, &policy, now);
        assert_eq!(tracker.state(), HealthState::Unhealthy);
        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Suspect);
        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Healthy);
    }

    #[test]
    fn test_pessimistic_start_needs_successes() {
        let policy = policy(3, 2);
        let now = Instant::now();
        let mut tracker = HealthTracker::new(InitialHealth::Suspect);
        assert_eq!(tracker.state(), HealthState::Suspect);
        assert!(!tracker.is_routable());

        tracker.record(Outcome::Success, &policy, now);
        assert!(!tracker.is_routable());
        tracker.record(Outcome::Success, &policy, now);
        assert_eq!(tracker.state(), HealthState::Healthy);
    }
}
