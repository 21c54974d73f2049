use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::config::StrategyKind;
use crate::http::server::AppState;
use crate::rate_limit::LimiterStats;
use crate::registry::InstanceStatus;
use crate::scaling::ScalingStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub strategy: StrategyKind,
    pub registry_version: u64,
    pub instances: usize,
    pub routable: usize,
    pub active_connections: usize,
}

#[derive(Deserialize)]
pub struct StrategyUpdate {
    pub strategy: String,
}

#[derive(Serialize)]
pub struct StrategyChanged {
    pub previous: StrategyKind,
    pub current: StrategyKind,
}

#[derive(Deserialize)]
pub struct UtilizationReport {
    pub utilization: f64,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let snapshot = state.registry.snapshot();
    let routable = snapshot.routable_count();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if routable > 0 { "operational" } else { "degraded" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        strategy: state.balancer.strategy_kind(),
        registry_version: snapshot.version(),
        instances: snapshot.len(),
        routable,
        active_connections: snapshot.total_active_connections(),
    })
}

pub async fn get_instances(State(state): State<AppState>) -> Json<Vec<InstanceStatus>> {
    let snapshot = state.registry.snapshot();
    Json(snapshot.instances().iter().map(|i| i.status()).collect())
}

pub async fn get_scaling(State(state): State<AppState>) -> Json<ScalingStatus> {
    Json(state.scaling.status())
}

pub async fn get_limiter(State(state): State<AppState>) -> Json<LimiterStats> {
    Json(state.limiter.stats())
}

pub async fn put_strategy(
    State(state): State<AppState>,
    Json(update): Json<StrategyUpdate>,
) -> Result<Json<StrategyChanged>, (StatusCode, String)> {
    let kind: StrategyKind = update
        .strategy
        .parse()
        .map_err(|e: String| (StatusCode::BAD_REQUEST, e))?;
    let previous = state.balancer.set_strategy(kind);
    Ok(Json(StrategyChanged {
        previous,
        current: kind,
    }))
}

pub async fn put_utilization(
    State(state): State<AppState>,
    Json(report): Json<UtilizationReport>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !report.utilization.is_finite() || !(0.0..=1.0).contains(&report.utilization) {
        return Err((
            StatusCode::BAD_REQUEST,
            "utilization must be between 0 and 1".to_string(),
        ));
    }
    state.scaling.report_utilization(report.utilization);
    Ok(StatusCode::NO_CONTENT)
}
