//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: instance assumed down, taken out of the candidate set
//! - Half-Open: a limited number of trial requests test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive request failures
//! Open → Half-Open: recovery_timeout elapsed, on the next selection
//! Half-Open → Closed: half_open_max_requests trials succeed
//! Half-Open → Open: any trial fails
//! ```
//!
//! # Design Decisions
//! - One breaker per instance, fed by proxied request outcomes only
//! - The recovery timeout and trial budget in effect when the circuit
//!   opened stay with it, so selection needs no policy lookup

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::health::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPolicy {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl From<&CircuitBreakerConfig> for CircuitPolicy {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            half_open_max_requests: config.half_open_max_requests.max(1),
        }
    }
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

/// `from → to` change caused by one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// Open: when trials may start. Half-Open: when a stalled trial budget is renewed.
    retry_at: Option<Instant>,
    recovery: Duration,
    trial_budget: u32,
    trials_started: u32,
    trial_successes: u32,
}

impl BreakerState {
    fn open(&mut self, policy: &CircuitPolicy, now: Instant) -> CircuitTransition {
        let from = self.state;
        self.state = CircuitState::Open;
        self.recovery = policy.recovery_timeout;
        self.trial_budget = policy.half_open_max_requests;
        self.retry_at = Some(now + policy.recovery_timeout);
        self.trials_started = 0;
        self.trial_successes = 0;
        CircuitTransition {
            from,
            to: CircuitState::Open,
        }
    }

    fn close(&mut self) -> CircuitTransition {
        let from = self.state;
        *self = BreakerState::default();
        CircuitTransition {
            from,
            to: CircuitState::Closed,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether selection may consider the instance at `now`. Does not
    /// change state.
    pub fn is_available(&self, now: Instant) -> bool {
        let state = self.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state.due(now),
            CircuitState::HalfOpen => state.trials_started < state.trial_budget || state.due(now),
        }
    }

    /// Claim the right to send one request. An open circuit past its
    /// recovery timeout moves to half-open and hands out trial slots.
    pub fn try_acquire(&self, now: Instant) -> (bool, Option<CircuitTransition>) {
        let mut state = self.lock();
        let mut transition = None;
        match state.state {
            CircuitState::Closed => return (true, None),
            CircuitState::Open => {
                if !state.due(now) {
                    return (false, None);
                }
                state.state = CircuitState::HalfOpen;
                state.trials_started = 0;
                state.trial_successes = 0;
                state.retry_at = Some(now + state.recovery);
                transition = Some(CircuitTransition {
                    from: CircuitState::Open,
                    to: CircuitState::HalfOpen,
                });
            }
            CircuitState::HalfOpen => {
                // Trials that never reported back must not pin the circuit half-open.
                if state.trials_started >= state.trial_budget && state.due(now) {
                    state.trials_started = 0;
                    state.retry_at = Some(now + state.recovery);
                }
            }
        }
        if state.trials_started < state.trial_budget {
            state.trials_started += 1;
            (true, transition)
        } else {
            (false, transition)
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) -> Option<CircuitTransition> {
        let mut state = self.lock();
        (state.state != CircuitState::Closed).then(|| state.close())
    }

    /// Feed a proxied request outcome.
    pub fn record(&self, outcome: Outcome, policy: &CircuitPolicy, now: Instant) -> Option<CircuitTransition> {
        let mut state = self.lock();
        if !policy.enabled {
            return (state.state != CircuitState::Closed).then(|| state.close());
        }
        match (state.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                state.consecutive_failures = 0;
                None
            }
            (CircuitState::Closed, Outcome::Failure) => {
                state.consecutive_failures += 1;
                (state.consecutive_failures >= policy.failure_threshold).then(|| state.open(policy, now))
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                state.trial_successes += 1;
                (state.trial_successes >= state.trial_budget).then(|| state.close())
            }
            (CircuitState::HalfOpen, Outcome::Failure) => Some(state.open(policy, now)),
            // Late results from requests sent before the circuit opened.
            (CircuitState::Open, _) => None,
        }
    }
}
