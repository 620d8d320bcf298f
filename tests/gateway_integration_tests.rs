//! # Gateway End-to-End Tests
//!
//! Requests enter through the proxy router and reach real local backends.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::Router;
use axum_test::TestServer;
use serde_json::Value;

use traffic_gateway::core::circuit_breaker::CircuitState;
use traffic_gateway::core::config::{BackendConfig, ServerConfig, ServiceConfig};
use traffic_gateway::gateway::gateway_router;
use traffic_gateway::load_balancing::BalancingStrategy;
use traffic_gateway::observability::metrics::noop;
use traffic_gateway::proxy::{PathRewrite, ProxyConfig, ReverseProxy};
use traffic_gateway::rate_limiting::{MemoryStore, RateLimitConfig, SlidingWindowRateLimiter};
use traffic_gateway::{Gateway, GatewayConfig};

use common::{echo_app, echoed_header, spawn_backend, status_app};

fn service(prefix: &str, urls: &[&str]) -> ServiceConfig {
    ServiceConfig {
        path_prefix: prefix.to_string(),
        strategy: BalancingStrategy::RoundRobin,
        backends: urls
            .iter()
            .map(|url| BackendConfig {
                url: url.to_string(),
                weight: 1,
            })
            .collect(),
        proxy: ProxyConfig {
            retries: 0,
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn limiter(max_requests: u64) -> Arc<SlidingWindowRateLimiter> {
    Arc::new(SlidingWindowRateLimiter::new(
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
            ..Default::default()
        },
        Arc::new(MemoryStore::new()),
        noop(),
    ))
}

fn server(gateway: Gateway, config: &ServerConfig) -> TestServer {
    TestServer::new(gateway_router(Arc::new(gateway), config)).unwrap()
}

fn user(id: &'static str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static("x-user-id"), HeaderValue::from_static(id))
}

#[tokio::test]
async fn test_requests_are_balanced_and_rewritten() {
    let a = spawn_backend(echo_app("basket-a")).await;
    let b = spawn_backend(echo_app("basket-b")).await;

    let mut basket = service("/api/basket", &[a.as_str(), b.as_str()]);
    basket.proxy.path_rewrite = PathRewrite::ReplacePrefix {
        from: "/api/basket".to_string(),
        to: "/v1/basket".to_string(),
    };

    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("basket", &basket).unwrap();
    let server = server(gateway, &ServerConfig::default());

    let mut seen = Vec::new();
    for _ in 0..4 {
        let response = server.get("/api/basket/items").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["path"], "/v1/basket/items");
        seen.push(body["backend"].as_str().unwrap().to_string());
    }

    assert_eq!(seen, vec!["basket-a", "basket-b", "basket-a", "basket-b"]);
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let catalog = spawn_backend(echo_app("catalog")).await;
    let payment = spawn_backend(echo_app("payment")).await;

    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("catalog", &service("/api", &[catalog.as_str()])).unwrap();
    gateway.add_service("payment", &service("/api/payment", &[payment.as_str()])).unwrap();
    let server = server(gateway, &ServerConfig::default());

    let body: Value = server.get("/api/payment/charge").await.json();
    assert_eq!(body["backend"], "payment");

    let body: Value = server.get("/api/paymentx").await.json();
    assert_eq!(body["backend"], "catalog");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let backend = spawn_backend(echo_app("basket")).await;
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("basket", &service("/api/basket", &[backend.as_str()])).unwrap();
    let server = server(gateway, &ServerConfig::default());

    let response = server.get("/api/unknown").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "service_not_found");
}

#[tokio::test]
async fn test_breaker_opens_after_upstream_errors() {
    let backend = spawn_backend(status_app(StatusCode::INTERNAL_SERVER_ERROR)).await;

    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("payment", &service("/api/payment", &[backend.as_str()])).unwrap();
    let gateway = Arc::new(gateway);
    let server = TestServer::new(gateway_router(gateway.clone(), &ServerConfig::default())).unwrap();

    for _ in 0..3 {
        let response = server.get("/api/payment/charge").await;
        assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(gateway.breakers().get_state("payment").unwrap(), CircuitState::Open);

    let response = server.get("/api/payment/charge").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "circuit_open");
    assert_eq!(body["error"]["message"], "Service temporarily unavailable");

    let stats = gateway.pool("payment").unwrap().get_stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.active_connections, 0);
}

#[tokio::test]
async fn test_disabled_breaker_relays_every_error() {
    let backend = spawn_backend(status_app(StatusCode::SERVICE_UNAVAILABLE)).await;

    let mut payment = service("/api/payment", &[backend.as_str()]);
    payment.circuit_breaker.enabled = false;
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("payment", &payment).unwrap();
    let gateway = Arc::new(gateway);
    let server = TestServer::new(gateway_router(gateway.clone(), &ServerConfig::default())).unwrap();

    for _ in 0..6 {
        let response = server.get("/api/payment").await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.json::<Value>()["status"], 503);
    }
    assert!(gateway.breakers().get_state("payment").is_err());
}

#[tokio::test]
async fn test_unreachable_backend_is_502_without_leaking_url() {
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("basket", &service("/", &["http://127.0.0.1:1"])).unwrap();
    let server = server(gateway, &ServerConfig::default());

    let response = server.get("/anything").await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    assert!(!response.text().contains("127.0.0.1"));
}

#[tokio::test]
async fn test_rate_limit_per_user() {
    let backend = spawn_backend(echo_app("basket")).await;
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), Some(limiter(2)), noop());
    gateway.add_service("basket", &service("/api/basket", &[backend.as_str()])).unwrap();
    let config = ServerConfig {
        trust_user_id_header: true,
        ..Default::default()
    };
    let server = server(gateway, &config);

    let (name, value) = user("alice");
    let first = server.get("/api/basket").add_header(name.clone(), value.clone()).await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");
    assert_eq!(echoed_header(&first.json::<Value>(), "x-user-id"), Some("alice"));

    let second = server.get("/api/basket").add_header(name.clone(), value.clone()).await;
    assert_eq!(second.status_code(), StatusCode::OK);
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = server.get("/api/basket").add_header(name, value).await;
    assert_eq!(third.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert!(third.headers().contains_key("retry-after"));
    assert_eq!(third.json::<Value>()["error"]["type"], "rate_limited");

    let (name, value) = user("bob");
    let other = server.get("/api/basket").add_header(name, value).await;
    assert_eq!(other.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_caller_headers_do_not_open_new_windows() {
    let backend = spawn_backend(echo_app("basket")).await;
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), Some(limiter(2)), noop());
    gateway.add_service("basket", &service("/api/basket", &[backend.as_str()])).unwrap();
    let server = server(gateway, &ServerConfig::default());

    let mut admitted = 0;
    for i in 0..10 {
        let response = server
            .get("/api/basket")
            .add_header(
                HeaderName::from_static("x-forwarded-for"),
                HeaderValue::from_str(&format!("198.51.100.{}", i)).unwrap(),
            )
            .add_header(
                HeaderName::from_static("x-user-id"),
                HeaderValue::from_str(&format!("u{}", i)).unwrap(),
            )
            .await;
        if response.status_code() == StatusCode::OK {
            admitted += 1;
        } else {
            assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
        }
    }
    assert_eq!(admitted, 2);
}

#[tokio::test]
async fn test_hung_backend_exhausts_retries_within_request_timeout() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            StatusCode::OK
        }
    });
    let backend = spawn_backend(app).await;

    let mut basket = service("/api/basket", &[backend.as_str()]);
    basket.proxy = ProxyConfig {
        timeout: Duration::from_millis(200),
        retries: 2,
        retry_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let mut config = GatewayConfig::default();
    config.server.request_timeout = Duration::from_secs(2);
    config.services.insert("basket".to_string(), basket);
    config.validate().unwrap();

    let gateway = Gateway::from_config(&config, None, noop()).unwrap();
    let server = server(gateway, &config.server);

    let response = server.get("/api/basket/items").await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.json::<Value>()["error"]["type"], "proxy_exhausted_retries");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let backend = spawn_backend(echo_app("basket")).await;
    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service("basket", &service("/api/basket", &[backend.as_str()])).unwrap();

    let config = ServerConfig {
        max_body_size: 16,
        ..Default::default()
    };
    let server = server(gateway, &config);

    let response = server
        .post("/api/basket/items")
        .bytes(Bytes::from(vec![b'x'; 64]))
        .await;
    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = server.post("/api/basket/items").bytes(Bytes::from_static(b"small")).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["body"], "small");
}

#[test]
fn test_sample_configuration_is_valid() {
    let config = GatewayConfig::from_yaml(include_str!("../config/gateway.yaml")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.services.len(), 3);
    assert_eq!(config.services["payment"].proxy.retries, 0);
    assert_eq!(
        config.services["notification"].strategy,
        BalancingStrategy::WeightedRoundRobin
    );

    let gateway = Gateway::from_config(&config, None, noop()).unwrap();
    assert_eq!(gateway.resolve_service("/api/basket/42"), Some("basket"));
    assert_eq!(gateway.pool("notification").unwrap().get_total_backends(), 2);
}
