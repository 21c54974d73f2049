//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → rate_limit middleware (429 + Retry-After on rejection)
//!     → proxy.rs (select instance, forward, retry, stream response)
//!     → Send to client
//! ```

pub mod proxy;
pub mod server;

pub use server::{apply_config, AppState, HttpServer};
