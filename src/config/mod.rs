//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via ArcSwap to all subsystems
//!
//! On reload signal:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<GatewayConfig>
//!     → subsystems pick up new parameters (strategy, limits, thresholds, policy)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - A bad reload never replaces a good configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, InitialHealth, ListenerConfig,
    LoadBalancerConfig, LogFormat, ObservabilityConfig, OrchestratorConfig, OrchestratorKind,
    RateLimitConfig, ScalingConfig, ScalingSignal, StrategyKind, TimeoutConfig,
};
pub use validation::ValidationError;
