//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted request
//!     → registry.snapshot() (lock-free, versioned)
//!     → routable instances minus already-tried ones and open circuits, in id order
//!     → Apply the active strategy:
//!         - round_robin.rs (rotate through instances)
//!         - least_conn.rs (pick instance with fewest connections)
//!         - ip_hash.rs (stable hash of the client key)
//!         - weighted.rs (smooth weighted round robin)
//!     → claim a circuit slot (half-open instances admit a few trials)
//!     → Return instance or SelectError::NoHealthyInstance
//! ```
//!
//! # Design Decisions
//! - The balancer never mutates the registry; the caller takes the connection guard
//! - The active strategy is swapped atomically at runtime
//! - Unhealthy instances are excluded before the strategy runs

pub mod ip_hash;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::config::StrategyKind;
use crate::registry::{log_circuit_transition, BackendInstance, InstanceId, RegistrySnapshot};

pub use ip_hash::IpHash;
pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted::Weighted;

/// Per-request inputs to selection.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Client identity used by `ip_hash`.
    pub client_key: Option<String>,
    /// Instances already tried for this request.
    pub exclude: Vec<InstanceId>,
}

impl RequestContext {
    pub fn new(client_key: Option<String>) -> Self {
        Self {
            client_key,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no healthy instance available")]
    NoHealthyInstance,
}

/// A selection algorithm.
///
/// `candidates` is non-empty, contains only routable instances and is sorted
/// by id.
pub trait SelectionStrategy: Send + Sync {
    fn pick(&self, candidates: &[Arc<BackendInstance>], ctx: &RequestContext) -> Option<Arc<BackendInstance>>;

    fn kind(&self) -> StrategyKind;
}

/// The closed set of strategies, selectable by name.
#[derive(Debug)]
pub enum Strategy {
    RoundRobin(RoundRobin),
    LeastConn(LeastConnections),
    IpHash(IpHash),
    Weighted(Weighted),
}

impl Strategy {
    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Strategy::RoundRobin(RoundRobin::new()),
            StrategyKind::LeastConn => Strategy::LeastConn(LeastConnections::new()),
            StrategyKind::IpHash => Strategy::IpHash(IpHash::new()),
            StrategyKind::Weighted => Strategy::Weighted(Weighted::new()),
        }
    }

    fn selector(&self) -> &dyn SelectionStrategy {
        match self {
            Strategy::RoundRobin(s) => s,
            Strategy::LeastConn(s) => s,
            Strategy::IpHash(s) => s,
            Strategy::Weighted(s) => s,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.selector().kind()
    }
}

/// Picks a target instance per request using a hot-swappable strategy.
pub struct LoadBalancer {
    strategy: ArcSwap<Strategy>,
}

impl LoadBalancer {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            strategy: ArcSwap::from_pointee(Strategy::from_kind(kind)),
        }
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.load().kind()
    }

    /// Swap the active strategy. Returns the previous kind.
    ///
    /// Selections already in progress finish with the strategy they loaded.
    pub fn set_strategy(&self, kind: StrategyKind) -> StrategyKind {
        let previous = self.strategy_kind();
        if previous != kind {
            self.strategy.store(Arc::new(Strategy::from_kind(kind)));
            tracing::info!(from = %previous, to = %kind, "Load balancing strategy swapped");
        }
        previous
    }

    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        ctx: &RequestContext,
    ) -> Result<Arc<BackendInstance>, SelectError> {
        let now = Instant::now();
        let mut candidates: Vec<Arc<BackendInstance>> = snapshot
            .routable()
            .filter(|i| !ctx.exclude.iter().any(|id| *id == i.id))
            .filter(|i| i.circuit().is_available(now))
            .cloned()
            .collect();

        if candidates.is_empty() {
            tracing::debug!(
                registered = snapshot.len(),
                excluded = ctx.exclude.len(),
                version = snapshot.version(),
                "No routable instance found"
            );
            return Err(SelectError::NoHealthyInstance);
        }

        let strategy = self.strategy.load();
        loop {
            let picked = strategy
                .selector()
                .pick(&candidates, ctx)
                .ok_or(SelectError::NoHealthyInstance)?;
            let (granted, transition) = picked.circuit().try_acquire(now);
            log_circuit_transition(&picked, transition);
            if granted {
                return Ok(picked);
            }
            // Half-open trial slots were taken concurrently.
            candidates.retain(|c| c.id != picked.id);
            if candidates.is_empty() {
                return Err(SelectError::NoHealthyInstance);
            }
        }
    }
}
