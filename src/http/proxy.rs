//! Request forwarding.
//!
//! # Responsibilities
//! - Select an instance and hold its connection guard for the whole exchange
//! - Forward the buffered request, bounded by the request timeout
//! - Retry transport failures and failure statuses on a different instance
//! - Report every attempt's outcome back to the registry
//! - Map exhaustion and empty pools to 503

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, request::Parts, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tokio::time;

use crate::health::{classify, Outcome};
use crate::http::server::AppState;
use crate::load_balancer::{RequestContext, SelectError};
use crate::observability::metrics;
use crate::rate_limit::ClientKey;
use crate::registry::ConnectionGuard;
use crate::resilience::{AttemptFailure, RetryPolicy};

static HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Main proxy handler.
pub async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let config = state.config.load_full();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let client_key = request.extensions().get::<ClientKey>().map(|k| k.0.clone());

    let (parts, body) = request.into_parts();
    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        "Proxying request"
    );

    let body_bytes = match axum::body::to_bytes(body, config.listener.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to read request body");
            metrics::record_request("invalid_request", start_time);
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let policy = RetryPolicy::from(&config.load_balancer);
    let timeout = Duration::from_secs(config.timeouts.request_secs);
    let mut ctx = RequestContext::new(client_key);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let snapshot = state.registry.snapshot();
        let instance = match state.balancer.select(&snapshot, &ctx) {
            Ok(instance) => instance,
            Err(SelectError::NoHealthyInstance) => {
                if attempt == 1 {
                    tracing::error!(
                        request_id = %request_id,
                        registered = snapshot.len(),
                        "No healthy instance available"
                    );
                } else {
                    tracing::warn!(request_id = %request_id, attempts = attempt - 1, "No instance left to retry on");
                }
                metrics::record_request("unavailable", start_time);
                return (StatusCode::SERVICE_UNAVAILABLE, "No healthy backends").into_response();
            }
        };

        let guard = instance.connection_guard();
        let upstream = match upstream_request(&parts, &body_bytes, instance.addr, &request_id) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to build upstream request");
                metrics::record_request("invalid_request", start_time);
                return (StatusCode::BAD_REQUEST, "Malformed request").into_response();
            }
        };

        let failure = match time::timeout(timeout, state.client.request(upstream)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let outcome = classify(Some(status));
                report_outcome(&state, &instance.id, outcome);

                if outcome == Outcome::Failure && policy.is_retryable(&parts.method, AttemptFailure::Transport) {
                    tracing::info!(
                        request_id = %request_id,
                        instance = %instance.id,
                        attempt,
                        status = %status,
                        "Upstream answered with a failure status"
                    );
                    AttemptFailure::Transport
                } else {
                    let label = match outcome {
                        Outcome::Success => "forwarded",
                        Outcome::Failure => "backend_error",
                    };
                    metrics::record_request(label, start_time);
                    return stream_response(response, guard);
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    request_id = %request_id,
                    instance = %instance.id,
                    attempt,
                    error = %e,
                    "Upstream error"
                );
                report_outcome(&state, &instance.id, Outcome::Failure);
                if e.is_connect() {
                    AttemptFailure::Connect
                } else {
                    AttemptFailure::Transport
                }
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    instance = %instance.id,
                    attempt,
                    timeout_secs = timeout.as_secs(),
                    "Upstream timeout"
                );
                report_outcome(&state, &instance.id, Outcome::Failure);
                AttemptFailure::Transport
            }
        };
        drop(guard);

        if !policy.should_retry(attempt, &parts.method, failure) {
            tracing::warn!(request_id = %request_id, attempts = attempt, "Giving up on upstream request");
            metrics::record_request("unavailable", start_time);
            return (StatusCode::SERVICE_UNAVAILABLE, "Upstream request failed").into_response();
        }

        ctx.exclude.push(instance.id.clone());
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
    }
}

/// Feed an attempt's outcome to the registry. Returns false when the
/// instance was deregistered while the attempt was in flight.
fn report_outcome(state: &AppState, id: &str, outcome: Outcome) -> bool {
    match state.registry.report_outcome(id, outcome) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(
                instance = %id,
                outcome = outcome.as_str(),
                error = %e,
                "Outcome for a departed instance dropped"
            );
            false
        }
    }
}

/// Build the request for one attempt against `addr`.
fn upstream_request(
    parts: &Parts,
    body: &Bytes,
    addr: SocketAddr,
    request_id: &str,
) -> Result<Request<Body>, axum::http::Error> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!("http://{}{}", addr, path_and_query));

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if !HOP_BY_HOP.contains(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }
    }

    builder.body(Body::from(body.clone()))
}

/// Stream the upstream response back, keeping the instance's connection
/// count raised until the body finishes or the client goes away.
fn stream_response(
    response: Response<hyper::body::Incoming>,
    guard: ConnectionGuard,
) -> Response {
    let (parts, body) = response.into_parts();
    let stream = Body::new(body).into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(stream))
}
