//! Keyed rate limiter.
//!
//! Buckets live in a sharded map; each bucket has its own lock, taken only
//! after the shard reference is released, so distinct clients never contend
//! beyond the shard lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time;

use crate::observability::metrics;
use crate::rate_limit::bucket::{Admission, ClientBucket, LimitParams, Quota};

pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<ClientBucket>>>,
    params: ArcSwap<LimitParams>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Limiter state reported by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_size: f64,
    pub max_requests_per_window: usize,
    pub window_secs: u64,
    pub tracked_clients: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

impl RateLimiter {
    pub fn new(params: LimitParams) -> Self {
        Self {
            buckets: DashMap::new(),
            params: ArcSwap::from_pointee(params),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &str, now: Instant) -> Admission {
        self.admit_with_quota_at(key, now).0
    }

    /// Admission plus the client's remaining quota. The quota is `None`
    /// while limiting is disabled.
    pub fn admit_with_quota(&self, key: &str) -> (Admission, Option<Quota>) {
        self.admit_with_quota_at(key, Instant::now())
    }

    pub fn admit_with_quota_at(&self, key: &str, now: Instant) -> (Admission, Option<Quota>) {
        let params = self.params.load();
        if !params.enabled {
            return (Admission::Admitted, None);
        }

        let bucket = match self.buckets.get(key) {
            Some(existing) => Arc::clone(existing.value()),
            None => {
                let created = Arc::clone(
                    self.buckets
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(ClientBucket::new(&params, now))))
                        .value(),
                );
                metrics::set_rate_limit_buckets(self.buckets.len());
                created
            }
        };

        let (decision, quota) = {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            let decision = bucket.check(&params, now);
            (decision, bucket.quota(&params, now))
        };

        match decision {
            Admission::Admitted => self.admitted.fetch_add(1, Ordering::Relaxed),
            Admission::Rejected { .. } => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        (decision, Some(quota))
    }

    /// Drop buckets idle for at least the configured TTL. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let ttl = self.params.load().idle_ttl;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            !bucket
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_idle(now, ttl)
        });
        let after = self.buckets.len();
        metrics::set_rate_limit_buckets(after);
        before.saturating_sub(after)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn params(&self) -> LimitParams {
        LimitParams::clone(&self.params.load())
    }

    /// Existing buckets keep their token level; it is capped at the new
    /// burst size on their next refill.
    pub fn update_params(&self, params: LimitParams) {
        if *self.params.load_full() != params {
            tracing::info!(
                enabled = params.enabled,
                rps = params.requests_per_second,
                burst = params.burst_size,
                "Rate limit parameters updated"
            );
            self.params.store(Arc::new(params));
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let params = self.params.load();
        LimiterStats {
            enabled: params.enabled,
            requests_per_second: params.requests_per_second,
            burst_size: params.burst_size,
            max_requests_per_window: params.max_requests_per_window,
            window_secs: params.window.as_secs(),
            tracked_clients: self.buckets.len(),
            admitted_total: self.admitted.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Periodically evict idle buckets until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let interval = self.params.load().cleanup_interval;
            tokio::select! {
                _ = time::sleep(interval) => {
                    let removed = self.evict_idle();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.len(), "Evicted idle rate limit buckets");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rate limit sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::bucket::RejectReason;
    use std::time::Duration;

    fn limiter(rps: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(LimitParams {
            requests_per_second: rps,
            burst_size: burst,
            max_requests_per_window: 0,
            ..LimitParams::default()
        })
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1.0, 2.0);
        let now = Instant::now();
        assert!(limiter.admit_at("10.0.0.1", now).is_admitted());
        assert!(limiter.admit_at("10.0.0.1", now).is_admitted());
        assert!(!limiter.admit_at("10.0.0.1", now).is_admitted());
        assert!(limiter.admit_at("10.0.0.2", now).is_admitted());
        assert_eq!(limiter.len(), 2);

        let stats = limiter.stats();
        assert_eq!(stats.admitted_total, 3);
        assert_eq!(stats.rejected_total, 1);
    }

    #[test]
    fn test_idle_buckets_are_evicted() {
        let limiter = limiter(10.0, 20.0);
        let start = Instant::now();
        limiter.admit_at("old", start);
        limiter.admit_at("fresh", start + Duration::from_secs(200));

        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(299)), 0);
        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(300)), 1);
        assert_eq!(limiter.len(), 1);

        // An evicted client starts over with a full bucket.
        let later = start + Duration::from_secs(301);
        for _ in 0..20 {
            assert!(limiter.admit_at("old", later).is_admitted());
        }
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = limiter(1.0, 1.0);
        limiter.update_params(LimitParams {
            enabled: false,
            ..limiter.params()
        });
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.admit_at("k", now).is_admitted());
        }
        assert!(limiter.is_empty());
        assert_eq!(limiter.admit_with_quota("k").1, None);
    }

    #[test]
    fn test_quota_counts_down_per_client() {
        let limiter = limiter(1.0, 3.0);
        let now = Instant::now();
        let remaining: Vec<u64> = (0..4)
            .map(|_| limiter.admit_with_quota_at("k", now).1.unwrap().remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert_eq!(limiter.admit_with_quota_at("other", now).1.unwrap().remaining, 2);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_burst() {
        let limiter = Arc::new(limiter(0.001, 50.0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.admit("shared").is_admitted()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_rejection_reason() {
        let limiter = limiter(10.0, 1.0);
        let now = Instant::now();
        limiter.admit_at("k", now);
        assert!(matches!(
            limiter.admit_at("k", now),
            Admission::Rejected { reason: RejectReason::TokensExhausted, .. }
        ));
    }
}
