//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, utilization in (0, 1])
//! - Check addresses and URLs parse
//! - Detect duplicate instance ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{BackendConfig, GatewayConfig, OrchestratorKind};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_backends(&mut errors, "backends", &config.backends);

    let rl = &config.rate_limit;
    if !(rl.requests_per_second.is_finite() && rl.requests_per_second > 0.0) {
        errors.push(ValidationError::new("rate_limit.requests_per_second", "must be a positive number"));
    }
    if rl.burst_size == 0 {
        errors.push(ValidationError::new("rate_limit.burst_size", "must be at least 1"));
    }
    if rl.max_requests_per_window > 0 && rl.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0 when a window cap is set"));
    }
    if rl.idle_ttl_secs == 0 {
        errors.push(ValidationError::new("rate_limit.idle_ttl_secs", "must be > 0"));
    }
    if rl.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("rate_limit.cleanup_interval_secs", "must be > 0"));
    }

    let hc = &config.health_check;
    if hc.interval_ms == 0 {
        errors.push(ValidationError::new("health_check.interval_ms", "must be > 0"));
    }
    if hc.timeout_ms == 0 {
        errors.push(ValidationError::new("health_check.timeout_ms", "must be > 0"));
    }
    if hc.failure_threshold == 0 {
        errors.push(ValidationError::new("health_check.failure_threshold", "must be at least 1"));
    }
    if hc.success_threshold == 0 {
        errors.push(ValidationError::new("health_check.success_threshold", "must be at least 1"));
    }
    if !hc.path.starts_with('/') {
        errors.push(ValidationError::new("health_check.path", "must start with '/'"));
    }
    if hc.eviction_after_secs == 0 {
        errors.push(ValidationError::new("health_check.eviction_after_secs", "must be > 0"));
    }

    let cb = &config.circuit_breaker;
    if cb.enabled {
        if cb.failure_threshold == 0 {
            errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if cb.recovery_timeout_secs == 0 {
            errors.push(ValidationError::new("circuit_breaker.recovery_timeout_secs", "must be > 0"));
        }
        if cb.half_open_max_requests == 0 {
            errors.push(ValidationError::new("circuit_breaker.half_open_max_requests", "must be at least 1"));
        }
    }

    let sc = &config.scaling;
    if sc.min_replicas > sc.max_replicas {
        errors.push(ValidationError::new(
            "scaling.min_replicas",
            format!("{} exceeds max_replicas {}", sc.min_replicas, sc.max_replicas),
        ));
    }
    if !(sc.target_utilization > 0.0 && sc.target_utilization <= 1.0) {
        errors.push(ValidationError::new("scaling.target_utilization", "must be in (0, 1]"));
    }
    if !(sc.replica_capacity.is_finite() && sc.replica_capacity > 0.0) {
        errors.push(ValidationError::new("scaling.replica_capacity", "must be a positive number"));
    }
    if sc.evaluation_window_secs == 0 {
        errors.push(ValidationError::new("scaling.evaluation_window_secs", "must be > 0"));
    }
    if sc.evaluation_interval_secs == 0 {
        errors.push(ValidationError::new("scaling.evaluation_interval_secs", "must be > 0"));
    }

    let orch = &config.orchestrator;
    match orch.kind {
        OrchestratorKind::Http => {
            if let Err(e) = url::Url::parse(&orch.url) {
                errors.push(ValidationError::new("orchestrator.url", format!("invalid URL: {}", e)));
            }
        }
        OrchestratorKind::Static => check_backends(&mut errors, "orchestrator.reserve", &orch.reserve),
    }
    if orch.backoff_base_ms > orch.backoff_max_ms {
        errors.push(ValidationError::new("orchestrator.backoff_base_ms", "exceeds backoff_max_ms"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }

    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{}' is not a socket address", value)));
    }
}

fn check_backends(errors: &mut Vec<ValidationError>, field: &str, backends: &[BackendConfig]) {
    let mut seen = HashSet::new();
    for (i, backend) in backends.iter().enumerate() {
        let entry = format!("{}[{}]", field, i);
        if backend.id.is_empty() {
            errors.push(ValidationError::new(format!("{}.id", entry), "must not be empty"));
        } else if !seen.insert(backend.id.as_str()) {
            errors.push(ValidationError::new(format!("{}.id", entry), format!("duplicate id '{}'", backend.id)));
        }
        check_addr(errors, &format!("{}.address", entry), &backend.address);
    }
}
