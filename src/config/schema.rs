//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::InstanceDescriptor;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limits).
    pub listener: ListenerConfig,

    /// Static backend instances.
    pub backends: Vec<BackendConfig>,

    /// Backend selection settings.
    pub load_balancer: LoadBalancerConfig,

    /// Per-instance circuit breaking on proxied request failures.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-client admission control.
    pub rate_limit: RateLimitConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Replica scaling policy.
    pub scaling: ScalingConfig,

    /// Orchestration collaborator used by the scaling controller.
    pub orchestrator: OrchestratorConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

impl GatewayConfig {
    /// Static backends as registry descriptors. Entries with unparsable
    /// addresses are skipped (validation reports them).
    pub fn static_descriptors(&self) -> Vec<InstanceDescriptor> {
        self.backends
            .iter()
            .filter_map(|b| {
                b.address.parse().ok().map(|address| InstanceDescriptor {
                    id: b.id.clone(),
                    address,
                    weight: b.weight,
                })
            })
            .collect()
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Largest request body buffered for forwarding and retries.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique instance identifier.
    pub id: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastConn,
    IpHash,
    Weighted,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastConn => "least_conn",
            StrategyKind::IpHash => "ip_hash",
            StrategyKind::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "least_conn" => Ok(StrategyKind::LeastConn),
            "ip_hash" => Ok(StrategyKind::IpHash),
            "weighted" => Ok(StrategyKind::Weighted),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Selection strategy.
    pub strategy: StrategyKind,

    /// Additional attempts on other instances after a transport failure.
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            max_retries: 2,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 200,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Consecutive request failures that open an instance's circuit.
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before letting trial requests through.
    pub recovery_timeout_secs: u64,

    /// Trial requests allowed while half-open; all must succeed to close.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            half_open_max_requests: 3,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Token refill rate per client.
    pub requests_per_second: f64,

    /// Bucket capacity.
    pub burst_size: u32,

    /// Admissions allowed per sliding window (0 disables the window cap).
    pub max_requests_per_window: u32,

    /// Sliding window length in seconds.
    pub window_secs: u64,

    /// Idle time after which a client's bucket is dropped.
    pub idle_ttl_secs: u64,

    /// Interval of the idle bucket sweep.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_size: 20,
            max_requests_per_window: 600,
            window_secs: 60,
            idle_ttl_secs: 300,
            cleanup_interval_secs: 30,
        }
    }
}

/// Health state assigned to newly registered instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitialHealth {
    /// Receive traffic immediately.
    #[default]
    Healthy,
    /// Wait for `success_threshold` good probes first.
    Suspect,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub failure_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub success_threshold: u32,

    /// State of freshly registered instances.
    pub initial_state: InitialHealth,

    /// Unhealthy instances are evicted after this many seconds.
    pub eviction_after_secs: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn eviction_after(&self) -> Duration {
        Duration::from_secs(self.eviction_after_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 2_000,
            path: "/health".to_string(),
            failure_threshold: 3,
            success_threshold: 3,
            initial_state: InitialHealth::Healthy,
            eviction_after_secs: 300,
        }
    }
}

/// Load signal the scaling controller sizes the pool from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScalingSignal {
    /// Active connections tracked by the registry.
    #[default]
    Connections,
    /// Utilization (0–1) reported by an external source.
    External,
}

/// Scaling policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Enable the scaling controller.
    pub enabled: bool,

    pub min_replicas: usize,

    pub max_replicas: usize,

    /// Desired utilization per replica, in (0, 1].
    pub target_utilization: f64,

    /// Minimum time between two scale intents in seconds.
    pub cooldown_secs: u64,

    /// Window load samples are averaged over, in seconds.
    pub evaluation_window_secs: u64,

    /// Interval between evaluations in seconds.
    pub evaluation_interval_secs: u64,

    /// Active connections one replica carries at 100% utilization.
    pub replica_capacity: f64,

    pub signal: ScalingSignal,
}

impl ScalingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn evaluation_window(&self) -> Duration {
        Duration::from_secs(self.evaluation_window_secs)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_replicas: 2,
            max_replicas: 10,
            target_utilization: 0.7,
            cooldown_secs: 60,
            evaluation_window_secs: 60,
            evaluation_interval_secs: 15,
            replica_capacity: 100.0,
            signal: ScalingSignal::Connections,
        }
    }
}

/// Orchestrator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    /// Fixed standby pool declared in `reserve`.
    #[default]
    Static,
    /// JSON over HTTP control API at `url`.
    Http,
}

/// Orchestration collaborator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub kind: OrchestratorKind,

    /// Base URL of the control API (http kind).
    pub url: String,

    /// Control API request timeout in seconds.
    pub timeout_secs: u64,

    /// Standby instances handed out on scale-up (static kind).
    pub reserve: Vec<BackendConfig>,

    /// Base hold after a failed scale intent in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum hold after repeated failures in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kind: OrchestratorKind::Static,
            url: "http://127.0.0.1:9400".to_string(),
            timeout_secs: 10,
            reserve: Vec::new(),
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (total time for one forwarded attempt) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
