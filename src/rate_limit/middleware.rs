//! Admission control middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::observability::metrics;
use crate::rate_limit::bucket::{Admission, Quota};
use crate::rate_limit::limiter::RateLimiter;

/// Client identity derived for admission, attached to the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

/// `X-Forwarded-For` first hop, then `X-Real-IP`, then the peer IP.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Stamp the quota headers. Reset is a Unix timestamp in seconds.
fn insert_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    let reset = (SystemTime::now() + quota.reset_after)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        .ceil() as u64;
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset));
}

/// Middleware function for per-client rate limiting.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer).unwrap_or_else(|| "unknown".to_string());

    let (admission, quota) = limiter.admit_with_quota(&key);
    match admission {
        Admission::Admitted => {
            request.extensions_mut().insert(ClientKey(key));
            let mut response = next.run(request).await;
            if let Some(quota) = &quota {
                insert_quota_headers(response.headers_mut(), quota);
            }
            response
        }
        Admission::Rejected { retry_after, reason } => {
            let retry_secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            tracing::debug!(client = %key, reason = reason.as_str(), retry_secs, "Rate limit exceeded");
            metrics::record_rate_limited(reason.as_str());
            metrics::record_request("rate_limited", start);

            let mut response = Response::new(Body::from("Rate limit exceeded"));
            *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            if let Some(quota) = &quota {
                insert_quota_headers(response.headers_mut(), quota);
            }
            response
        }
    }
}
