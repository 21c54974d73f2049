//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe every instance concurrently (bounded timeout)
//!     → registry.mark_probe_result()
//!     → Evict instances unhealthy past eviction_after → scaling controller
//!
//! Passive health checks (passive.rs):
//!     Proxied request outcome
//!     → classify()
//!     → registry.report_outcome()
//!
//! State machine (state.rs):
//!     Healthy ←→ Suspect ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Active and passive checks feed the same state machine
//! - State transitions require consecutive successes/failures
//! - Health state is per-instance, never pool-wide

pub mod active;
pub mod passive;
pub mod state;

pub use active::{HealthMonitor, HttpProber, Prober};
pub use passive::classify;
pub use state::{HealthPolicy, HealthState, HealthTracker, Outcome, Transition};
