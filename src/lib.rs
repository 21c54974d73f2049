//! fleet-gate: traffic management in front of a fleet of service instances.
//!
//! Admission control, load balancing, health tracking and replica scaling
//! over a shared, versioned instance registry.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod rate_limit;
pub mod registry;
pub mod resilience;
pub mod scaling;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
