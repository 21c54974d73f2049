//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler
//! - Wire up middleware (request ID, tracing, admission control)
//! - Seed the registry and run discovery before serving
//! - Spawn background loops (health, bucket sweeper, scaling, admin API)
//! - Apply configuration reloads

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{body::Body, middleware, routing::any, Router};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin;
use crate::config::GatewayConfig;
use crate::health::{HealthMonitor, HealthPolicy, HttpProber, Prober};
use crate::http::proxy::proxy_handler;
use crate::load_balancer::LoadBalancer;
use crate::rate_limit::{rate_limit_middleware, LimitParams, RateLimiter};
use crate::registry::{InstanceOrigin, InstanceRegistry};
use crate::resilience::CircuitPolicy;
use crate::scaling::orchestrator::{self, Orchestrator, OrchestratorError};
use crate::scaling::ScalingController;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<InstanceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub limiter: Arc<RateLimiter>,
    pub scaling: Arc<ScalingController>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub client: Client<HttpConnector, Body>,
    pub started_at: Instant,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    state: AppState,
    prober: Arc<dyn Prober>,
}

impl HttpServer {
    /// Create a server using the orchestrator selected by `config`.
    pub fn new(config: GatewayConfig) -> Result<Self, OrchestratorError> {
        let orchestrator = orchestrator::from_config(&config.orchestrator)?;
        Ok(Self::with_orchestrator(config, orchestrator))
    }

    pub fn with_orchestrator(config: GatewayConfig, orchestrator: Arc<dyn Orchestrator>) -> Self {
        let registry = Arc::new(InstanceRegistry::new(HealthPolicy::from(&config.health_check)));
        registry.set_circuit_policy(CircuitPolicy::from(&config.circuit_breaker));
        for descriptor in config.static_descriptors() {
            registry.register(descriptor, InstanceOrigin::Static);
        }

        let balancer = Arc::new(LoadBalancer::new(config.load_balancer.strategy));
        let limiter = Arc::new(RateLimiter::new(LimitParams::from(&config.rate_limit)));

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeouts.connect_secs)));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let config = Arc::new(ArcSwap::from_pointee(config));
        let scaling = Arc::new(ScalingController::new(registry.clone(), orchestrator, config.clone()));

        Self {
            state: AppState {
                registry,
                balancer,
                limiter,
                scaling,
                config,
                client,
                started_at: Instant::now(),
            },
            prober: Arc::new(HttpProber::new()),
        }
    }

    /// Replace the active health prober.
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the Axum router with all middleware layers.
    pub fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .layer(middleware::from_fn_with_state(
                state.limiter.clone(),
                rate_limit_middleware,
            ))
            .with_state(state)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let state = self.state;
        let config = state.config.load_full();

        // Orchestrator-managed instances join before traffic starts.
        state.scaling.discover().await;
        tracing::info!(
            instances = state.registry.len(),
            strategy = %state.balancer.strategy_kind(),
            "Registry seeded"
        );

        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(state.registry.clone(), self.prober, state.config.clone())
            .with_evictions(evictions_tx);
        tokio::spawn(monitor.run(shutdown.resubscribe()));
        tokio::spawn(state.limiter.clone().run_sweeper(shutdown.resubscribe()));
        tokio::spawn(state.scaling.clone().run(evictions_rx, shutdown.resubscribe()));
        tokio::spawn(apply_config_updates(
            state.clone(),
            config_updates,
            shutdown.resubscribe(),
        ));

        if config.admin.enabled {
            let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
            tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
            let admin_app = admin::router(state.clone());
            let mut admin_shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                let served = axum::serve(admin_listener, admin_app)
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "Admin API stopped");
                }
            });
        }

        tracing::info!(address = %addr, "HTTP server starting");
        let app = Self::build_router(state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Apply validated configuration reloads until shutdown.
async fn apply_config_updates(
    state: AppState,
    mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(new_config) => apply_config(&state, new_config),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}

/// Swap in a new configuration. In-flight requests keep the instance they
/// already selected.
pub fn apply_config(state: &AppState, new_config: GatewayConfig) {
    let current = state.config.load_full();
    if current.listener.bind_address != new_config.listener.bind_address {
        tracing::warn!(
            current = %current.listener.bind_address,
            requested = %new_config.listener.bind_address,
            "Listener address changes require a restart"
        );
    }

    state.balancer.set_strategy(new_config.load_balancer.strategy);
    state.limiter.update_params(LimitParams::from(&new_config.rate_limit));
    state
        .registry
        .set_health_policy(HealthPolicy::from(&new_config.health_check));
    state
        .registry
        .set_circuit_policy(CircuitPolicy::from(&new_config.circuit_breaker));
    let (added, removed) = state.registry.reconcile_static(&new_config.static_descriptors());
    state.config.store(Arc::new(new_config));

    tracing::info!(
        added,
        removed,
        version = state.registry.version(),
        "Configuration reloaded"
    );
}
