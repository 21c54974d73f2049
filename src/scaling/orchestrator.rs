//! Orchestration collaborator.
//!
//! The gateway never starts or stops processes itself; it asks an
//! orchestrator and registers whatever the orchestrator reports back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{OrchestratorConfig, OrchestratorKind};
use crate::registry::{InstanceDescriptor, InstanceId};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("orchestrator rejected the request: {0}")]
    Rejected(String),

    #[error("orchestrator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid orchestrator URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Start `count` instances and describe the ones that came up.
    async fn scale_up(&self, count: usize) -> Result<Vec<InstanceDescriptor>, OrchestratorError>;

    /// Stop the given instances.
    async fn scale_down(&self, ids: &[InstanceId]) -> Result<(), OrchestratorError>;

    /// Instances the orchestrator currently runs.
    async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>, OrchestratorError>;

    fn name(&self) -> &'static str;
}

/// Build the orchestrator selected by configuration.
pub fn from_config(config: &OrchestratorConfig) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
    match config.kind {
        OrchestratorKind::Static => {
            let reserve = config
                .reserve
                .iter()
                .filter_map(|b| {
                    b.address.parse().ok().map(|address| InstanceDescriptor {
                        id: b.id.clone(),
                        address,
                        weight: b.weight,
                    })
                })
                .collect();
            Ok(Arc::new(StaticOrchestrator::new(reserve)))
        }
        OrchestratorKind::Http => Ok(Arc::new(HttpOrchestrator::new(
            &config.url,
            Duration::from_secs(config.timeout_secs),
        )?)),
    }
}

/// Hands out instances from a fixed standby pool.
#[derive(Debug, Default)]
pub struct StaticOrchestrator {
    pools: Mutex<Pools>,
}

#[derive(Debug, Default)]
struct Pools {
    standby: Vec<InstanceDescriptor>,
    running: Vec<InstanceDescriptor>,
}

impl StaticOrchestrator {
    pub fn new(standby: Vec<InstanceDescriptor>) -> Self {
        Self {
            pools: Mutex::new(Pools {
                standby,
                running: Vec::new(),
            }),
        }
    }

    pub fn standby_len(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).standby.len()
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    async fn scale_up(&self, count: usize) -> Result<Vec<InstanceDescriptor>, OrchestratorError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if pools.standby.is_empty() {
            return Err(OrchestratorError::Unavailable("reserve pool exhausted".into()));
        }
        let take = count.min(pools.standby.len());
        let started: Vec<_> = pools.standby.drain(..take).collect();
        pools.running.extend(started.iter().cloned());
        Ok(started)
    }

    async fn scale_down(&self, ids: &[InstanceId]) -> Result<(), OrchestratorError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, running): (Vec<_>, Vec<_>) = std::mem::take(&mut pools.running)
            .into_iter()
            .partition(|d| ids.contains(&d.id));
        pools.running = running;
        pools.standby.extend(stopped);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>, OrchestratorError> {
        Ok(self.pools.lock().unwrap_or_else(PoisonError::into_inner).running.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Serialize)]
struct ScaleUpRequest {
    count: usize,
}

#[derive(Debug, Serialize)]
struct ScaleDownRequest<'a> {
    ids: &'a [InstanceId],
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    instances: Vec<InstanceDescriptor>,
}

/// JSON control API:
/// - `POST {url}/scale-up` `{"count": n}` → `{"instances": [...]}`
/// - `POST {url}/scale-down` `{"ids": [...]}`
/// - `GET {url}/instances` → `{"instances": [...]}`
pub struct HttpOrchestrator {
    client: reqwest::Client,
    base: Url,
}

impl HttpOrchestrator {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, OrchestratorError> {
        let mut base = Url::parse(url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    async fn instances_from(&self, response: reqwest::Response) -> Result<Vec<InstanceDescriptor>, OrchestratorError> {
        let response = check_status(response).await?;
        Ok(response.json::<InstanceList>().await?.instances)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, OrchestratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(OrchestratorError::Unavailable(format!("{}: {}", status, body)))
    } else {
        Err(OrchestratorError::Rejected(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn scale_up(&self, count: usize) -> Result<Vec<InstanceDescriptor>, OrchestratorError> {
        let response = self
            .client
            .post(self.base.join("scale-up")?)
            .json(&ScaleUpRequest { count })
            .send()
            .await?;
        self.instances_from(response).await
    }

    async fn scale_down(&self, ids: &[InstanceId]) -> Result<(), OrchestratorError> {
        let response = self
            .client
            .post(self.base.join("scale-down")?)
            .json(&ScaleDownRequest { ids })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>, OrchestratorError> {
        let response = self.client.get(self.base.join("instances")?).send().await?;
        self.instances_from(response).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
