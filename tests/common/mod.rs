//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use fleet_gate::config::{BackendConfig, GatewayConfig};
use fleet_gate::http::{AppState, HttpServer};
use fleet_gate::lifecycle::Shutdown;
use fleet_gate::scaling::{Orchestrator, StaticOrchestrator};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

type Responder = dyn Fn(usize) -> (StatusCode, String) + Send + Sync;

/// A mock instance. `/health` answers 200 while `healthy` is set; every
/// other path counts a hit and answers via the responder.
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub healthy: Arc<AtomicBool>,
}

impl MockBackend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct BackendState {
    hits: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
    respond: Arc<Responder>,
}

async fn health(State(state): State<BackendState>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn serve(State(state): State<BackendState>) -> (StatusCode, String) {
    let call = state.hits.fetch_add(1, Ordering::SeqCst);
    if !state.healthy.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "down".into());
    }
    (state.respond)(call)
}

/// Start a programmable backend on an ephemeral port. The responder gets the
/// zero-based call index.
pub async fn start_programmable_backend<F>(respond: F) -> MockBackend
where
    F: Fn(usize) -> (StatusCode, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = BackendState {
        hits: Arc::new(AtomicUsize::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
        respond: Arc::new(respond),
    };
    let backend = MockBackend {
        addr,
        hits: state.hits.clone(),
        healthy: state.healthy.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .fallback(serve)
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    backend
}

/// Start a backend that answers 200 with its own name.
pub async fn start_mock_backend(name: &'static str) -> MockBackend {
    start_programmable_backend(move |_| (StatusCode::OK, name.to_string())).await
}

/// Start a backend that holds every non-health request for `delay`
/// before answering.
pub async fn start_slow_backend(delay: Duration) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = MockBackend {
        addr,
        hits: Arc::new(AtomicUsize::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
    };
    let hits = backend.hits.clone();
    let app = Router::new().route("/health", get(|| async { StatusCode::OK })).fallback(move || {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            "slow"
        }
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    backend
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn backend(id: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        address: addr.to_string(),
        weight: 1,
    }
}

/// Config with generous limits, scaling off and slow health checks.
pub fn base_config(backends: Vec<BackendConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backends = backends;
    config.rate_limit.requests_per_second = 1_000.0;
    config.rate_limit.burst_size = 1_000;
    config.rate_limit.max_requests_per_window = 0;
    config.health_check.interval_ms = 60_000;
    config.scaling.enabled = false;
    config.observability.metrics_enabled = false;
    config
}

pub struct Gateway {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
    pub updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_gateway(config: GatewayConfig) -> Gateway {
    start_gateway_with(config, Arc::new(StaticOrchestrator::default())).await
}

pub async fn start_gateway_with(config: GatewayConfig, orchestrator: Arc<dyn Orchestrator>) -> Gateway {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::with_orchestrator(config, orchestrator);
    let state = server.state().clone();

    let shutdown = Shutdown::new();
    let (updates, config_updates) = mpsc::unbounded_channel();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    Gateway {
        addr,
        state,
        shutdown,
        updates,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Poll `check` every 25ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
