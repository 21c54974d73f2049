//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered instance
//! - Feed probe results into the registry's state machine
//! - Hard-evict instances that stay unhealthy too long

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::config::GatewayConfig;
use crate::health::state::Outcome;
use crate::observability::metrics;
use crate::registry::{BackendInstance, InstanceId, InstanceRegistry};

/// Performs a single health probe against an instance.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: SocketAddr, path: &str) -> Outcome;
}

/// `GET http://{addr}{path}`; any 2xx is healthy.
pub struct HttpProber {
    client: Client<HttpConnector, Body>,
}

impl HttpProber {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, addr: SocketAddr, path: &str) -> Outcome {
        let request = match Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", addr, path))
            .header("user-agent", "fleet-gate-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to build health check request");
                return Outcome::Failure;
            }
        };

        match self.client.request(request).await {
            Ok(response) if response.status().is_success() => Outcome::Success,
            Ok(response) => {
                tracing::warn!(addr = %addr, status = %response.status(), "Health check failed: non-success status");
                Outcome::Failure
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Health check failed: connection error");
                Outcome::Failure
            }
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    prober: Arc<dyn Prober>,
    config: Arc<ArcSwap<GatewayConfig>>,
    evictions: Option<mpsc::UnboundedSender<Arc<BackendInstance>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        prober: Arc<dyn Prober>,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
            evictions: None,
        }
    }

    /// Report evicted instances on `tx` (consumed by the scaling controller).
    pub fn with_evictions(mut self, tx: mpsc::UnboundedSender<Arc<BackendInstance>>) -> Self {
        self.evictions = Some(tx);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        {
            let config = self.config.load();
            tracing::info!(
                enabled = config.health_check.enabled,
                interval_ms = config.health_check.interval_ms,
                path = %config.health_check.path,
                "Health monitor starting"
            );
        }

        loop {
            let interval = self.config.load().health_check.interval();
            tokio::select! {
                _ = time::sleep(interval) => {
                    if self.config.load().health_check.enabled {
                        self.check_all().await;
                    }
                    self.evict_expired(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every registered instance concurrently, each bounded by the probe timeout.
    pub async fn check_all(&self) {
        let (path, timeout) = {
            let config = self.config.load();
            (config.health_check.path.clone(), config.health_check.timeout())
        };
        let snapshot = self.registry.snapshot();

        let probes = snapshot.instances().iter().map(|instance| {
            let prober = Arc::clone(&self.prober);
            let path = path.as_str();
            async move {
                let outcome = match time::timeout(timeout, prober.probe(instance.addr, path)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(instance = %instance.id, addr = %instance.addr, "Health check failed: timeout");
                        Outcome::Failure
                    }
                };
                (instance.id.clone(), outcome)
            }
        });

        for (id, outcome) in join_all(probes).await {
            metrics::record_health_probe(outcome);
            if self.registry.mark_probe_result(&id, outcome).is_err() {
                tracing::debug!(instance = %id, "Probed instance was deregistered meanwhile");
            }
        }
    }

    /// Deregister instances unhealthy for longer than `eviction_after`.
    /// Returns the evicted ids.
    pub fn evict_expired(&self, now: Instant) -> Vec<InstanceId> {
        let limit: Duration = self.config.load().health_check.eviction_after();
        let expired: Vec<InstanceId> = self
            .registry
            .snapshot()
            .instances()
            .iter()
            .filter(|i| i.unhealthy_for(now).is_some_and(|d| d >= limit))
            .map(|i| i.id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Ok(instance) = self.registry.deregister(&id) {
                tracing::warn!(instance = %id, after_secs = limit.as_secs(), "Evicting instance stuck unhealthy");
                if let Some(tx) = &self.evictions {
                    if tx.send(instance).is_err() {
                        tracing::debug!(instance = %id, "Eviction receiver gone, replacement not requested");
                    }
                }
                evicted.push(id);
            }
        }
        evicted
    }
}
