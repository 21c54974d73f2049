//! Scaling against a mock HTTP orchestrator.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use fleet_gate::config::{GatewayConfig, OrchestratorKind, ScalingSignal};
use fleet_gate::registry::InstanceDescriptor;
use fleet_gate::scaling::{orchestrator, ScaleDirection};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

mod common;

use common::{backend, base_config, client, eventually, start_gateway_with, start_mock_backend};

#[derive(Default)]
struct Pools {
    standby: Vec<InstanceDescriptor>,
    running: Vec<InstanceDescriptor>,
}

type Shared = Arc<Mutex<Pools>>;

#[derive(Deserialize)]
struct ScaleUp {
    count: usize,
}

#[derive(Deserialize)]
struct ScaleDown {
    ids: Vec<String>,
}

async fn scale_up(State(pools): State<Shared>, Json(req): Json<ScaleUp>) -> Result<Json<Value>, StatusCode> {
    let mut pools = pools.lock().unwrap();
    if pools.standby.is_empty() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let take = req.count.min(pools.standby.len());
    let started: Vec<_> = pools.standby.drain(..take).collect();
    pools.running.extend(started.iter().cloned());
    Ok(Json(json!({ "instances": started })))
}

async fn scale_down(State(pools): State<Shared>, Json(req): Json<ScaleDown>) -> Json<Value> {
    let mut pools = pools.lock().unwrap();
    let (stopped, running): (Vec<_>, Vec<_>) = std::mem::take(&mut pools.running)
        .into_iter()
        .partition(|d| req.ids.contains(&d.id));
    pools.running = running;
    pools.standby.extend(stopped);
    Json(json!({}))
}

async fn instances(State(pools): State<Shared>) -> Json<Value> {
    Json(json!({ "instances": pools.lock().unwrap().running.clone() }))
}

async fn start_orchestrator(standby: Vec<InstanceDescriptor>, running: Vec<InstanceDescriptor>) -> (SocketAddr, Shared) {
    let pools: Shared = Arc::new(Mutex::new(Pools { standby, running }));
    let app = Router::new()
        .route("/scale-up", post(scale_up))
        .route("/scale-down", post(scale_down))
        .route("/instances", get(instances))
        .with_state(pools.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, pools)
}

async fn replica(id: &'static str) -> InstanceDescriptor {
    let mock = start_mock_backend(id).await;
    InstanceDescriptor {
        id: id.to_string(),
        address: mock.addr,
        weight: 1,
    }
}

async fn scaling_config(orchestrator_addr: SocketAddr) -> GatewayConfig {
    let seed = start_mock_backend("s0").await;
    let mut config = base_config(vec![backend("s0", seed.addr)]);
    config.scaling.signal = ScalingSignal::External;
    config.scaling.min_replicas = 1;
    config.scaling.max_replicas = 3;
    config.scaling.target_utilization = 0.5;
    config.scaling.cooldown_secs = 0;
    config.scaling.evaluation_interval_secs = 1;
    config.orchestrator.kind = OrchestratorKind::Http;
    config.orchestrator.url = format!("http://{}/", orchestrator_addr);
    config.orchestrator.timeout_secs = 2;
    config
}

#[tokio::test]
async fn test_scale_up_registers_started_instances() {
    let (addr, pools) = start_orchestrator(vec![replica("r1").await, replica("r2").await, replica("r3").await], vec![]).await;
    let config = scaling_config(addr).await;
    let orch = orchestrator::from_config(&config.orchestrator).unwrap();
    let gateway = start_gateway_with(config, orch).await;
    let state = gateway.state.clone();

    // 1 replica at full utilization: desired = ceil(1 / 0.5) = 2.
    state.scaling.report_utilization(1.0);
    let intent = state.scaling.tick().await.unwrap();
    assert_eq!(intent.direction, ScaleDirection::Up);
    assert_eq!(intent.count, 1);
    assert_eq!(intent.desired, 2);
    assert_eq!(state.registry.len(), 2);
    assert!(state.registry.get("r1").is_ok());

    // Window mean is now 1.5, clamped by max_replicas.
    let intent = state.scaling.tick().await.unwrap();
    assert_eq!(intent.desired, 3);
    assert_eq!(state.registry.len(), 3);
    assert_eq!(pools.lock().unwrap().running.len(), 2);

    let client = client();
    for _ in 0..6 {
        let res = client.get(gateway.url("/")).send().await.unwrap();
        assert_eq!(res.status(), 200);
    }
    assert!(state.registry.get("r2").unwrap().total_requests() > 0);
}

#[tokio::test]
async fn test_discovered_instances_scaled_down_to_minimum() {
    let (addr, pools) = start_orchestrator(vec![], vec![replica("r1").await, replica("r2").await]).await;
    let config = scaling_config(addr).await;
    let orch = orchestrator::from_config(&config.orchestrator).unwrap();
    let gateway = start_gateway_with(config, orch).await;
    let state = gateway.state.clone();

    assert!(eventually(Duration::from_secs(3), || state.registry.len() == 3).await);

    state.scaling.report_utilization(0.0);
    let intent = state.scaling.tick().await.unwrap();
    assert_eq!(intent.direction, ScaleDirection::Down);
    assert_eq!(intent.count, 2);

    // Static backends are never scale-down victims.
    assert_eq!(state.registry.len(), 1);
    assert!(state.registry.get("s0").is_ok());
    let pools = pools.lock().unwrap();
    assert!(pools.running.is_empty());
    assert_eq!(pools.standby.len(), 2);
}

#[tokio::test]
async fn test_orchestrator_failure_holds_scale() {
    let (addr, _pools) = start_orchestrator(vec![], vec![]).await;
    let config = scaling_config(addr).await;
    let orch = orchestrator::from_config(&config.orchestrator).unwrap();
    let gateway = start_gateway_with(config, orch).await;
    let state = gateway.state.clone();

    state.scaling.report_utilization(1.0);
    assert!(state.scaling.tick().await.is_some());
    assert_eq!(state.registry.len(), 1);

    let status = state.scaling.status();
    assert_eq!(status.consecutive_failures, 1);
    assert!(status.hold_remaining_secs > 0.0);
    let last = status.last_intent.unwrap();
    assert!(!last.succeeded);

    // Held: no new intent until the backoff elapses.
    assert!(state.scaling.tick().await.is_none());
}

#[tokio::test]
async fn test_controller_loop_scales_on_its_own() {
    let (addr, _pools) = start_orchestrator(vec![replica("r1").await], vec![]).await;
    let mut config = scaling_config(addr).await;
    config.scaling.enabled = true;
    let orch = orchestrator::from_config(&config.orchestrator).unwrap();
    let gateway = start_gateway_with(config, orch).await;
    let state = gateway.state.clone();

    state.scaling.report_utilization(0.9);
    assert!(eventually(Duration::from_secs(5), || state.registry.len() == 2).await);
}
