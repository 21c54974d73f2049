//! Per-client token bucket with a sliding-window cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Parameters shared by every bucket. Swapped as a whole on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitParams {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_size: f64,
    /// 0 disables the window cap.
    pub max_requests_per_window: usize,
    pub window: Duration,
    pub idle_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl From<&RateLimitConfig> for LimitParams {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            requests_per_second: config.requests_per_second,
            burst_size: f64::from(config.burst_size.max(1)),
            max_requests_per_window: config.max_requests_per_window as usize,
            window: Duration::from_secs(config.window_secs),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
        }
    }
}

impl Default for LimitParams {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TokensExhausted,
    WindowExceeded,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::TokensExhausted => "tokens",
            RejectReason::WindowExceeded => "window",
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected {
        retry_after: Duration,
        reason: RejectReason,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Quota left for one client, reported in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// Time until the full quota is available again.
    pub reset_after: Duration,
}

#[derive(Debug)]
pub struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    /// Admission instants inside the current window, oldest first.
    recent: VecDeque<Instant>,
}

impl ClientBucket {
    /// A fresh bucket starts full.
    pub fn new(params: &LimitParams, now: Instant) -> Self {
        Self {
            tokens: params.burst_size,
            last_refill: now,
            last_seen: now,
            recent: VecDeque::new(),
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn check(&mut self, params: &LimitParams, now: Instant) -> Admission {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * params.requests_per_second).min(params.burst_size);
        self.last_refill = now;
        self.last_seen = now;

        if params.max_requests_per_window > 0 {
            while let Some(&oldest) = self.recent.front() {
                if oldest + params.window <= now {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
            if self.recent.len() >= params.max_requests_per_window {
                let retry_after = self
                    .recent
                    .front()
                    .map(|&oldest| (oldest + params.window).saturating_duration_since(now))
                    .unwrap_or(params.window);
                return Admission::Rejected {
                    retry_after,
                    reason: RejectReason::WindowExceeded,
                };
            }
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            if params.max_requests_per_window > 0 {
                self.recent.push_back(now);
            }
            Admission::Admitted
        } else {
            Admission::Rejected {
                retry_after: Duration::from_secs_f64((1.0 - self.tokens) / params.requests_per_second),
                reason: RejectReason::TokensExhausted,
            }
        }
    }

    /// Quota as of the last `check`. With a window cap the tighter of the
    /// two limits wins.
    pub fn quota(&self, params: &LimitParams, now: Instant) -> Quota {
        let refill = if params.requests_per_second > 0.0 {
            Duration::from_secs_f64(((params.burst_size - self.tokens).max(0.0)) / params.requests_per_second)
        } else {
            Duration::ZERO
        };
        let mut quota = Quota {
            limit: params.burst_size as u64,
            remaining: self.tokens.max(0.0).floor() as u64,
            reset_after: refill,
        };
        if params.max_requests_per_window > 0 {
            let cap = params.max_requests_per_window as u64;
            let used = self.recent.len() as u64;
            quota.limit = quota.limit.min(cap);
            quota.remaining = quota.remaining.min(cap.saturating_sub(used));
            if let Some(&newest) = self.recent.back() {
                quota.reset_after = quota
                    .reset_after
                    .max((newest + params.window).saturating_duration_since(now));
            }
        }
        quota
    }

    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= ttl
    }
}
