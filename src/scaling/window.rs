//! Sliding window of load samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Load expressed in replicas' worth of work at full utilization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub at: Instant,
    pub load: f64,
}

#[derive(Debug)]
pub struct LoadWindow {
    span: Duration,
    samples: VecDeque<LoadSample>,
}

impl LoadWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
        }
    }

    pub fn set_span(&mut self, span: Duration) {
        self.span = span;
    }

    pub fn record(&mut self, at: Instant, load: f64) {
        self.samples.push_back(LoadSample { at, load });
        self.prune(at);
    }

    /// Mean over the samples taken within the span before `now`.
    pub fn mean(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| s.load).sum();
        Some(sum / self.samples.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest.at) > self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
