//! Startup orchestration.
//!
//! Config first, then logging and metrics, then the listener, then the
//! server with its background loops.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, ConfigError, GatewayConfig};
use crate::http::HttpServer;
use crate::lifecycle::{signals, Shutdown};
use crate::observability::{init_logging, init_metrics};
use crate::scaling::OrchestratorError;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to initialize logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to build orchestrator: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Load the configuration at `path`, or defaults when none is given.
pub fn resolve_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => Ok(GatewayConfig::default()),
    }
}

/// Run the gateway until SIGINT or SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let config = resolve_config(config_path.as_deref())?;
    init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleet-gate starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        strategy = %config.load_balancer.strategy,
        scaling = config.scaling.enabled,
        orchestrator = ?config.orchestrator.kind,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        init_metrics(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();

    // Reloads arrive from the file watcher and from SIGHUP. The watcher
    // handle must outlive the server.
    let (config_updates, _watcher) = match &config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            tokio::spawn(signals::reload_on_hangup(path.clone(), watcher.sender()));
            let handle = match watcher.run() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Config file watching unavailable, SIGHUP reload only");
                    None
                }
            };
            (updates, handle)
        }
        None => {
            let (_tx, updates) = mpsc::unbounded_channel();
            (updates, None)
        }
    };

    let server = HttpServer::new(config)?;
    tokio::spawn(signals::wait_for_shutdown(shutdown.clone()));
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
