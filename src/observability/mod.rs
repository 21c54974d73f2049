//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Request / health / scaling events
//!     → logging.rs (tracing subscriber, JSON or pretty)
//!     → metrics.rs (Prometheus recorder, scraped on metrics_address)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
