//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarded attempt fails before a response:
//!     → retries.rs (retryable? attempts left?)
//!     → backoff.rs (delay before the next attempt)
//!     → load balancer picks a different instance
//!
//! Proxied request outcome:
//!     → circuit_breaker.rs (per instance; open circuits leave the candidate set)
//!
//! Orchestrator intent fails:
//!     → backoff.rs (hold before the next intent)
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;

pub use backoff::{calculate_backoff, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitPolicy, CircuitState, CircuitTransition};
pub use retries::{AttemptFailure, RetryPolicy};
