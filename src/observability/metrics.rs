//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gate_requests_total{outcome}` (counter): requests by outcome
//!   (`forwarded`, `rate_limited`, `unavailable`, `backend_error`)
//! - `gate_request_duration_seconds{outcome}` (histogram): end-to-end latency
//! - `gate_instance_active_connections{instance}` (gauge)
//! - `gate_instance_health{instance}` (gauge): 2=healthy, 1=suspect, 0=unhealthy
//! - `gate_instance_requests_total{instance,result}` (counter)
//! - `gate_circuit_transitions_total{to}` (counter)
//! - `gate_rate_limited_total{reason}` (counter)
//! - `gate_rate_limit_buckets` (gauge): tracked client buckets
//! - `gate_replicas_current` / `gate_replicas_desired` (gauges)
//! - `gate_scale_intents_total{direction}` (counter)
//! - `gate_health_probes_total{result}` (counter)
//! - `gate_registry_version` (gauge)
//!
//! Recording is a no-op until [`init_metrics`] installs the Prometheus
//! recorder, so subsystems can record unconditionally.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::health::{HealthState, Outcome};
use crate::resilience::CircuitState;

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus recorder and start its scrape listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(LATENCY_BUCKETS)?
        .install()?;

    describe_counter!("gate_requests_total", "Requests handled by outcome");
    describe_histogram!(
        "gate_request_duration_seconds",
        "End-to-end request latency in seconds"
    );
    describe_gauge!(
        "gate_instance_active_connections",
        "In-flight requests per backend instance"
    );
    describe_gauge!(
        "gate_instance_health",
        "Instance health (2=healthy, 1=suspect, 0=unhealthy)"
    );
    describe_counter!(
        "gate_instance_requests_total",
        "Forwarded requests per instance by result"
    );
    describe_counter!(
        "gate_circuit_transitions_total",
        "Circuit breaker state changes by target state"
    );
    describe_counter!("gate_rate_limited_total", "Rejected admissions by reason");
    describe_gauge!("gate_rate_limit_buckets", "Client buckets currently tracked");
    describe_gauge!("gate_replicas_current", "Registered replicas");
    describe_gauge!("gate_replicas_desired", "Replica count the controller wants");
    describe_counter!("gate_scale_intents_total", "Scale intents issued by direction");
    describe_counter!("gate_health_probes_total", "Active probes by result");
    describe_gauge!("gate_registry_version", "Current registry snapshot version");

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a finished client request.
pub fn record_request(outcome: &'static str, start_time: Instant) {
    counter!("gate_requests_total", "outcome" => outcome).increment(1);
    histogram!("gate_request_duration_seconds", "outcome" => outcome)
        .record(start_time.elapsed().as_secs_f64());
}

pub fn record_instance_health(instance: &str, state: HealthState) {
    gauge!("gate_instance_health", "instance" => instance.to_string()).set(state.gauge_value());
}

pub fn record_instance_request(instance: &str, outcome: Outcome) {
    counter!(
        "gate_instance_requests_total",
        "instance" => instance.to_string(),
        "result" => outcome.as_str()
    )
    .increment(1);
}

pub fn set_active_connections(instance: &str, active: usize) {
    gauge!("gate_instance_active_connections", "instance" => instance.to_string()).set(active as f64);
}

/// A deregistered instance keeps no in-flight gauge. Its health series
/// is left at the last reported state.
pub fn forget_instance(instance: &str) {
    gauge!("gate_instance_active_connections", "instance" => instance.to_string()).set(0.0);
}

pub fn record_circuit_transition(to: CircuitState) {
    counter!("gate_circuit_transitions_total", "to" => to.as_str()).increment(1);
}

pub fn set_registry_version(version: u64) {
    gauge!("gate_registry_version").set(version as f64);
}

pub fn record_rate_limited(reason: &'static str) {
    counter!("gate_rate_limited_total", "reason" => reason).increment(1);
}

pub fn set_rate_limit_buckets(count: usize) {
    gauge!("gate_rate_limit_buckets").set(count as f64);
}

pub fn set_replicas(current: usize, desired: usize) {
    gauge!("gate_replicas_current").set(current as f64);
    gauge!("gate_replicas_desired").set(desired as f64);
}

pub fn record_scale_intent(direction: &'static str) {
    counter!("gate_scale_intents_total", "direction" => direction).increment(1);
}

pub fn record_health_probe(outcome: Outcome) {
    counter!("gate_health_probes_total", "result" => outcome.as_str()).increment(1);
}
