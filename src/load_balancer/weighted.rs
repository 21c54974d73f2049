//! Smooth weighted round robin.
//!
//! On every pick each candidate earns its weight in credit, the richest
//! candidate wins and pays back the total weight of the round. Over
//! `sum(weights)` picks each instance is chosen exactly `weight` times, and
//! heavy instances are interleaved with light ones instead of bursting.
//!
//! Instances skipped for a retry keep their credit. Instances missing from
//! the candidate set for any other reason (unroutable, open circuit,
//! deregistered) lose it.
//!
//! Credit ties go to the lowest id. Weight-0 instances are only picked when
//! every candidate has weight 0, in which case all count as weight 1.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::StrategyKind;
use crate::load_balancer::{RequestContext, SelectionStrategy};
use crate::registry::{BackendInstance, InstanceId};

#[derive(Debug, Default)]
pub struct Weighted {
    credits: Mutex<HashMap<InstanceId, i64>>,
}

impl Weighted {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for Weighted {
    fn pick(&self, candidates: &[Arc<BackendInstance>], ctx: &RequestContext) -> Option<Arc<BackendInstance>> {
        let all_zero = candidates.iter().all(|i| i.weight == 0);
        let weight_of = |i: &BackendInstance| -> i64 {
            if all_zero {
                1
            } else {
                i64::from(i.weight)
            }
        };

        let mut credits = self.credits.lock().unwrap_or_else(PoisonError::into_inner);
        if credits.len() > candidates.len() {
            let live: HashSet<&str> = candidates
                .iter()
                .map(|i| i.id.as_str())
                .chain(ctx.exclude.iter().map(String::as_str))
                .collect();
            credits.retain(|id, _| live.contains(id.as_str()));
        }

        let mut total = 0i64;
        let mut best: Option<(&Arc<BackendInstance>, i64)> = None;
        for candidate in candidates {
            let weight = weight_of(candidate);
            if weight == 0 {
                continue;
            }
            total += weight;
            let credit = credits.entry(candidate.id.clone()).or_insert(0);
            *credit += weight;
            if best.map_or(true, |(_, c)| *credit > c) {
                best = Some((candidate, *credit));
            }
        }

        let (winner, _) = best?;
        if let Some(credit) = credits.get_mut(&winner.id) {
            *credit -= total;
        }
        Some(winner.clone())
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Weighted
    }
}
