//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{RequestContext, SelectionStrategy};
use crate::registry::BackendInstance;

/// Least connections selector.
/// Selects the instance with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for LeastConnections {
    fn pick(&self, candidates: &[Arc<BackendInstance>], _ctx: &RequestContext) -> Option<Arc<BackendInstance>> {
        // Ties go to the first candidate, i.e. the lowest id.
        candidates
            .iter()
            .min_by_key(|i| i.active_connections())
            .cloned()
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastConn
    }
}
