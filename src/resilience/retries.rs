//! Retry logic.
//!
//! # Design Decisions
//! - Idempotent methods are retried on any transport failure
//! - Other methods are retried only when the connection was never
//!   established, so the backend cannot have seen the request
//! - Every retry goes to a different instance

use std::time::Duration;

use axum::http::Method;

use crate::config::LoadBalancerConfig;
use crate::resilience::backoff::ExponentialBackoff;

/// How a forwarded attempt failed before a response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Could not connect; the request was never sent.
    Connect,
    /// Connection broke or the attempt timed out after sending.
    Transport,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    /// Attempts allowed in total (first try plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, method: &Method, failure: AttemptFailure) -> bool {
        failure == AttemptFailure::Connect || is_idempotent(method)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, method: &Method, failure: AttemptFailure) -> bool {
        attempt < self.max_attempts() && self.is_retryable(method, failure)
    }

    pub fn delay_before(&self, retry: u32) -> Duration {
        self.backoff.delay(retry)
    }
}

impl From<&LoadBalancerConfig> for RetryPolicy {
    fn from(config: &LoadBalancerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: ExponentialBackoff::from_millis(config.retry_base_delay_ms, config.retry_max_delay_ms),
        }
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}
