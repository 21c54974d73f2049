//! Config file watching for hot reload.
//!
//! A single save usually fires several filesystem events (truncate, write,
//! rename). Events are collapsed until the file has been quiet for the
//! debounce window, then the file is read once. Content that fails to parse
//! or validate, and rewrites that leave the bytes unchanged, never reach
//! the server.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time;

use crate::config::loader::parse_config;
use crate::config::schema::GatewayConfig;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                debounce: DEFAULT_DEBOUNCE,
                update_tx,
            },
            update_rx,
        )
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sender that can inject configuration updates (e.g. on SIGHUP).
    pub fn sender(&self) -> mpsc::UnboundedSender<GatewayConfig> {
        self.update_tx.clone()
    }

    /// Start watching. Must be called inside a Tokio runtime.
    ///
    /// The returned watcher must be kept alive for as long as reloads are
    /// wanted; dropping it also ends the forwarding task.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if event_tx.send(()).is_err() {
                        tracing::debug!("Config change forwarder gone, event dropped");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let current = fs::read_to_string(&self.path).ok();
        tracing::info!(path = ?self.path, debounce_ms = self.debounce.as_millis() as u64, "Config watcher started");
        tokio::spawn(forward_changes(self.path, self.debounce, event_rx, self.update_tx, current));
        Ok(watcher)
    }
}

async fn forward_changes(
    path: PathBuf,
    debounce: Duration,
    mut events: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<GatewayConfig>,
    mut applied: Option<String>,
) {
    while events.recv().await.is_some() {
        loop {
            match time::timeout(debounce, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Config file unreadable, keeping current configuration");
                continue;
            }
        };
        if applied.as_deref() == Some(content.as_str()) {
            tracing::debug!(path = ?path, "Config file unchanged, reload skipped");
            continue;
        }

        match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = ?path, "Config file change detected, reloading");
                if updates.send(config).is_err() {
                    return;
                }
                applied = Some(content);
            }
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Rejected config change, keeping current configuration");
            }
        }
    }
}
