//! Per-client admission control.
//!
//! # Data Flow
//! ```text
//! Incoming request
//!     → middleware.rs (derive client key)
//!     → limiter.rs (look up or create the client's bucket)
//!     → bucket.rs (token bucket + sliding window)
//!     → Admitted: continue to the proxy handler
//!     → Rejected: 429 with Retry-After
//!     → either way: X-RateLimit-Limit / -Remaining / -Reset
//!
//! Background:
//!     sweeper evicts buckets idle past idle_ttl
//! ```

pub mod bucket;
pub mod limiter;
pub mod middleware;

pub use bucket::{Admission, ClientBucket, LimitParams, Quota, RejectReason};
pub use limiter::{LimiterStats, RateLimiter};
pub use middleware::{client_key, rate_limit_middleware, ClientKey};
