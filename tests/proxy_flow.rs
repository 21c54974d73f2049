//! End-to-end request flow: admission, selection, forwarding and retries.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::StatusCode;
use fleet_gate::config::StrategyKind;
use fleet_gate::resilience::CircuitState;

mod common;

use common::{backend, base_config, client, dead_addr, eventually, start_gateway, start_mock_backend};

#[tokio::test]
async fn test_round_robin_spreads_requests() {
    let a = start_mock_backend("a").await;
    let b = start_mock_backend("b").await;
    let c = start_mock_backend("c").await;
    let gateway = start_gateway(base_config(vec![
        backend("a", a.addr),
        backend("b", b.addr),
        backend("c", c.addr),
    ]))
    .await;

    let client = client();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        let res = client.get(gateway.url("/items")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        *seen.entry(res.text().await.unwrap()).or_default() += 1;
    }

    assert_eq!(seen.get("a"), Some(&2));
    assert_eq!(seen.get("b"), Some(&2));
    assert_eq!(seen.get("c"), Some(&2));
}

#[tokio::test]
async fn test_rate_limited_client_gets_retry_after() {
    let a = start_mock_backend("a").await;
    let mut config = base_config(vec![backend("a", a.addr)]);
    config.rate_limit.requests_per_second = 1.0;
    config.rate_limit.burst_size = 2;
    let gateway = start_gateway(config).await;

    let client = client();
    let send = |ip: &'static str| {
        client
            .get(gateway.url("/"))
            .header("x-forwarded-for", ip)
            .send()
    };

    let first = send("198.51.100.1").await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");
    assert_eq!(send("198.51.100.1").await.unwrap().status(), 200);

    let limited = send("198.51.100.1").await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["retry-after"], "1");
    assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");
    assert!(limited.headers().contains_key("x-ratelimit-reset"));

    // Other clients have their own bucket.
    assert_eq!(send("198.51.100.2").await.unwrap().status(), 200);
    assert_eq!(a.hits(), 3);
}

#[tokio::test]
async fn test_no_backends_returns_503() {
    let gateway = start_gateway(base_config(vec![])).await;

    let res = client().get(gateway.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_retry_skips_dead_instance() {
    let dead = dead_addr().await;
    let b = start_mock_backend("b").await;
    let gateway = start_gateway(base_config(vec![backend("a", dead), backend("b", b.addr)])).await;

    let client = client();
    for _ in 0..4 {
        let res = client.get(gateway.url("/")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "b");
    }

    // Connect failures count against the dead instance.
    let a = gateway.state.registry.get("a").unwrap();
    assert!(a.failed_requests() >= 1);
}

#[tokio::test]
async fn test_connect_failure_retries_non_idempotent_request() {
    let dead = dead_addr().await;
    let b = start_mock_backend("b").await;
    let gateway = start_gateway(base_config(vec![backend("a", dead), backend("b", b.addr)])).await;

    let res = client()
        .post(gateway.url("/orders"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(b.hits(), 1);
}

#[tokio::test]
async fn test_upstream_503_retried_only_for_idempotent_methods() {
    let failing = common::start_programmable_backend(|_| (StatusCode::SERVICE_UNAVAILABLE, "busy".into())).await;
    let b = start_mock_backend("b").await;
    let config = base_config(vec![backend("a", failing.addr), backend("b", b.addr)]);

    // GET: first pick is "a", retried on "b".
    let gateway = start_gateway(config.clone()).await;
    let res = client().get(gateway.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "b");
    assert_eq!(failing.hits(), 1);
    drop(gateway);

    // POST: the upstream answer is passed through.
    let gateway = start_gateway(config).await;
    let res = client().post(gateway.url("/")).body("x").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.text().await.unwrap(), "busy");
    assert_eq!(failing.hits(), 2);
    assert_eq!(b.hits(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_returns_503() {
    let gateway = start_gateway(base_config(vec![
        backend("a", dead_addr().await),
        backend("b", dead_addr().await),
    ]))
    .await;

    let res = client().get(gateway.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_exhausted_retries_on_failure_status_return_503() {
    let a = common::start_programmable_backend(|_| (StatusCode::BAD_GATEWAY, "bad".into())).await;
    let b = common::start_programmable_backend(|_| (StatusCode::GATEWAY_TIMEOUT, "late".into())).await;
    let mut config = base_config(vec![backend("a", a.addr), backend("b", b.addr)]);
    config.load_balancer.max_retries = 1;
    let gateway = start_gateway(config).await;

    let res = client().get(gateway.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.text().await.unwrap(), "Upstream request failed");
    assert_eq!(a.hits() + b.hits(), 2);
}

#[tokio::test]
async fn test_failing_instance_circuit_opens() {
    let failing = common::start_programmable_backend(|_| (StatusCode::BAD_GATEWAY, "bad".into())).await;
    let b = start_mock_backend("b").await;
    let mut config = base_config(vec![backend("a", failing.addr), backend("b", b.addr)]);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_timeout_secs = 60;
    config.health_check.failure_threshold = 100;
    let gateway = start_gateway(config).await;

    let client = client();
    for _ in 0..10 {
        let res = client.get(gateway.url("/")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "b");
    }

    assert_eq!(failing.hits(), 2);
    let a = gateway.state.registry.get("a").unwrap();
    assert!(a.is_routable());
    assert_eq!(a.status().circuit, CircuitState::Open);
}

#[tokio::test]
async fn test_client_timeout_releases_connection_slot() {
    let slow = common::start_slow_backend(Duration::from_millis(1_500)).await;
    let gateway = start_gateway(base_config(vec![backend("a", slow.addr)])).await;
    let registry = gateway.state.registry.clone();

    let impatient = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let url = gateway.url("/slow");
    let request = tokio::spawn(async move { impatient.get(url).send().await });

    assert!(eventually(Duration::from_secs(1), || registry.snapshot().total_active_connections() == 1).await);
    assert!(request.await.unwrap().is_err());

    assert!(
        eventually(Duration::from_secs(5), || registry.snapshot().total_active_connections() == 0).await
    );
    // Outlive the backend's answer; the slot must not be released twice.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(registry.snapshot().total_active_connections(), 0);
    assert_eq!(registry.get("a").unwrap().active_connections(), 0);
    assert_eq!(slow.hits(), 1);
}

#[tokio::test]
async fn test_ip_hash_pins_client_to_instance() {
    let a = start_mock_backend("a").await;
    let b = start_mock_backend("b").await;
    let c = start_mock_backend("c").await;
    let mut config = base_config(vec![
        backend("a", a.addr),
        backend("b", b.addr),
        backend("c", c.addr),
    ]);
    config.load_balancer.strategy = StrategyKind::IpHash;
    let gateway = start_gateway(config).await;

    let client = client();
    let mut bodies = Vec::new();
    for _ in 0..5 {
        let res = client
            .get(gateway.url("/"))
            .header("x-forwarded-for", "203.0.113.9")
            .send()
            .await
            .unwrap();
        bodies.push(res.text().await.unwrap());
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_connection_count_released_after_response() {
    let a = start_mock_backend("a").await;
    let gateway = start_gateway(base_config(vec![backend("a", a.addr)])).await;

    let client = client();
    for _ in 0..3 {
        let res = client.get(gateway.url("/")).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "a");
    }

    let registry = gateway.state.registry.clone();
    assert!(
        eventually(Duration::from_secs(2), || registry.snapshot().total_active_connections() == 0).await
    );
    assert_eq!(registry.get("a").unwrap().total_requests(), 3);
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let a = start_mock_backend("a").await;
    let gateway = start_gateway(base_config(vec![backend("a", a.addr)])).await;

    let client = client();
    let res = client
        .get(gateway.url("/"))
        .header("x-request-id", "trace-42")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-request-id"], "trace-42");

    let res = client.get(gateway.url("/")).send().await.unwrap();
    assert!(res.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_reload_swaps_strategy_and_membership() {
    let a = start_mock_backend("a").await;
    let b = start_mock_backend("b").await;
    let config = base_config(vec![backend("a", a.addr), backend("b", b.addr)]);
    let gateway = start_gateway(config.clone()).await;

    let mut reloaded = config;
    reloaded.load_balancer.strategy = StrategyKind::Weighted;
    reloaded.backends = vec![backend("b", b.addr)];
    gateway.updates.send(reloaded).unwrap();

    let state = gateway.state.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            state.registry.len() == 1 && state.balancer.strategy_kind() == StrategyKind::Weighted
        })
        .await
    );

    let client = client();
    for _ in 0..3 {
        let res = client.get(gateway.url("/")).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "b");
    }
    assert_eq!(a.hits(), 0);
}
