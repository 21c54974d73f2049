//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::StrategyKind;
use crate::load_balancer::{RequestContext, SelectionStrategy};
use crate::registry::BackendInstance;

/// Round-robin selector.
/// Stores an internal counter to rotate through instances.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next(&self, candidates: &[Arc<BackendInstance>]) -> Option<Arc<BackendInstance>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }
}

impl SelectionStrategy for RoundRobin {
    fn pick(&self, candidates: &[Arc<BackendInstance>], _ctx: &RequestContext) -> Option<Arc<BackendInstance>> {
        self.next(candidates)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::instance;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let instances = vec![instance("a", 8080, 1), instance("b", 8081, 1)];
        let ctx = RequestContext::default();

        assert_eq!(lb.pick(&instances, &ctx).unwrap().id, "a");
        assert_eq!(lb.pick(&instances, &ctx).unwrap().id, "b");
        assert_eq!(lb.pick(&instances, &ctx).unwrap().id, "a");
    }

    #[test]
    fn test_even_distribution() {
        let lb = RoundRobin::new();
        let instances = vec![instance("a", 8080, 1), instance("b", 8081, 1), instance("c", 8082, 1)];
        let ctx = RequestContext::default();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(lb.pick(&instances, &ctx).unwrap().id.clone()).or_default() += 1;
        }
        for count in counts.values() {
            assert!(*count == 33 || *count == 34, "uneven count {}", count);
        }
    }
}
