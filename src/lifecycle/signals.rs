//! OS signal handling.
//!
//! SIGINT and SIGTERM trigger graceful shutdown. SIGHUP re-reads the config
//! file and pushes it through the same channel the file watcher uses.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::config::{load_config, GatewayConfig};
use crate::lifecycle::Shutdown;

/// Wait for a termination signal, then trigger `shutdown`.
pub async fn wait_for_shutdown(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    let listeners = shutdown.trigger();
    tracing::info!(listeners, "Graceful shutdown initiated");
}

/// Reload `path` on every SIGHUP until the update channel closes.
#[cfg(unix)]
pub async fn reload_on_hangup(path: PathBuf, updates: mpsc::UnboundedSender<GatewayConfig>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        tracing::info!(path = ?path, "Received SIGHUP, reloading configuration");
        match load_config(&path) {
            Ok(config) => {
                if updates.send(config).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn reload_on_hangup(_path: PathBuf, _updates: mpsc::UnboundedSender<GatewayConfig>) {}
