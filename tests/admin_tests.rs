//! # Admin API Tests
//!
//! Every admin route, driven through `axum_test::TestServer`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};

use traffic_gateway::admin::{admin_router, AdminState};
use traffic_gateway::core::circuit_breaker::CircuitBreakerConfig;
use traffic_gateway::load_balancing::{BalancingStrategy, LoadBalancer};
use traffic_gateway::observability::metrics::noop;
use traffic_gateway::proxy::{ProxyConfig, ProxyRequest, ReverseProxy};
use traffic_gateway::rate_limiting::{MemoryStore, RateLimitConfig, SlidingWindowRateLimiter};
use traffic_gateway::Gateway;

use common::{spawn_backend, status_app};

fn pool(name: &str, urls: &[&str]) -> Arc<LoadBalancer> {
    let lb = LoadBalancer::new(name, BalancingStrategy::RoundRobin, noop());
    for url in urls {
        lb.add_backend(url, 1).unwrap();
    }
    Arc::new(lb)
}

fn gateway(with_limiter: bool) -> Arc<Gateway> {
    let limiter = with_limiter.then(|| {
        Arc::new(SlidingWindowRateLimiter::new(
            RateLimitConfig {
                max_requests: 5,
                window: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            noop(),
        ))
    });

    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), limiter, noop());
    gateway.add_service_pool(
        "basket",
        "/api/basket",
        pool("basket", &["http://10.0.0.1:8080", "http://10.0.0.2:8080"]),
        ProxyConfig::default(),
        CircuitBreakerConfig::default(),
    );
    gateway.add_service_pool(
        "payment",
        "/api/payment",
        pool("payment", &["http://10.0.1.1:8080"]),
        ProxyConfig::default(),
        CircuitBreakerConfig::default(),
    );
    Arc::new(gateway)
}

fn test_server(gateway: Arc<Gateway>) -> TestServer {
    TestServer::new(admin_router(AdminState::new(gateway))).unwrap()
}

#[tokio::test]
async fn test_status_reports_derived_health() {
    let gateway = gateway(false);
    let server = test_server(gateway.clone());

    let body: Value = server.get("/admin/status").await.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"].as_array().unwrap().len(), 2);

    gateway
        .pool("basket")
        .unwrap()
        .set_backend_health("http://10.0.0.1:8080", false)
        .unwrap();

    let response = server.get("/admin/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "degraded");

    let basket = &body["services"][0];
    assert_eq!(basket["service"], "basket");
    assert_eq!(basket["status"], "degraded");
    assert_eq!(basket["healthy_backends"], 1);
    assert_eq!(basket["total_backends"], 2);
    assert_eq!(basket["circuit_state"], "closed");
    assert_eq!(body["services"][1]["status"], "healthy");
}

#[tokio::test]
async fn test_services_lists_every_pool() {
    let server = test_server(gateway(false));

    let response = server.get("/admin/services").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["services"][0]["service"], "basket");
    assert_eq!(body["services"][0]["strategy"], "round_robin");
    assert_eq!(body["services"][0]["backends"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_load_balancer_stats() {
    let server = test_server(gateway(false));

    let response = server.get("/admin/loadbalancer/payment").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["total_backends"], 1);
    assert_eq!(body["backends"][0]["url"], "http://10.0.1.1:8080/");
    assert_eq!(body["backends"][0]["healthy"], true);

    let response = server.get("/admin/loadbalancer/shipping").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["error"], "service_not_found");
}

#[tokio::test]
async fn test_backend_add_and_remove() {
    let gateway = gateway(false);
    let server = test_server(gateway.clone());

    let response = server
        .post("/admin/loadbalancer/basket/backends")
        .json(&json!({ "url": "http://10.0.0.3:8080", "weight": 2 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["weight"], 2);
    assert_eq!(body["healthy"], true);
    assert_eq!(gateway.pool("basket").unwrap().get_total_backends(), 3);

    let duplicate = server
        .post("/admin/loadbalancer/basket/backends")
        .json(&json!({ "url": "http://10.0.0.3:8080" }))
        .await;
    assert_eq!(duplicate.status_code(), StatusCode::BAD_REQUEST);

    let invalid = server
        .post("/admin/loadbalancer/basket/backends")
        .json(&json!({ "url": "ftp://10.0.0.9" }))
        .await;
    assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(invalid.json::<Value>()["error"], "invalid_backend_url");

    let unknown_service = server
        .post("/admin/loadbalancer/shipping/backends")
        .json(&json!({ "url": "http://10.0.0.3:8080" }))
        .await;
    assert_eq!(unknown_service.status_code(), StatusCode::NOT_FOUND);

    let removed = server
        .delete("/admin/loadbalancer/basket/backends")
        .json(&json!({ "url": "http://10.0.0.3:8080" }))
        .await;
    assert_eq!(removed.status_code(), StatusCode::OK);
    assert_eq!(removed.json::<Value>()["success"], true);
    assert_eq!(gateway.pool("basket").unwrap().get_total_backends(), 2);

    let missing = server
        .delete("/admin/loadbalancer/basket/backends")
        .json(&json!({ "url": "http://10.0.0.3:8080" }))
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["error"], "backend_not_found");
}

#[tokio::test]
async fn test_backend_health_override() {
    let gateway = gateway(false);
    let server = test_server(gateway.clone());

    let response = server
        .put("/admin/loadbalancer/payment/backends/health")
        .json(&json!({ "url": "http://10.0.1.1:8080", "healthy": false }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let stats: Value = server.get("/admin/loadbalancer/payment").await.json();
    assert_eq!(stats["healthy_backends"], 0);
    assert_eq!(stats["backends"][0]["healthy"], false);
    assert!(stats["backends"][0]["last_health_check"].is_string());

    let missing = server
        .put("/admin/loadbalancer/payment/backends/health")
        .json(&json!({ "url": "http://10.9.9.9:8080", "healthy": true }))
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_is_503_when_a_service_has_no_healthy_backend() {
    let gateway = gateway(false);
    let server = test_server(gateway.clone());

    let response = server.get("/admin/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["healthy"], true);

    gateway
        .pool("payment")
        .unwrap()
        .set_backend_health("http://10.0.1.1:8080", false)
        .unwrap();

    let response = server.get("/admin/health").await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["healthy"], false);
    assert_eq!(body["unavailable_services"], json!(["payment"]));
}

#[tokio::test]
async fn test_circuit_breaker_inspect_and_reset() {
    let backend = spawn_backend(status_app(StatusCode::BAD_GATEWAY)).await;

    let mut gateway = Gateway::new(ReverseProxy::new().unwrap(), None, noop());
    gateway.add_service_pool(
        "payment",
        "/api/payment",
        pool("payment", &[backend.as_str()]),
        ProxyConfig {
            retries: 0,
            ..Default::default()
        },
        CircuitBreakerConfig::default(),
    );
    let gateway = Arc::new(gateway);
    let server = test_server(gateway.clone());

    let body: Value = server.get("/admin/circuitbreaker/payment").await.json();
    assert_eq!(body["state"], "closed");
    assert_eq!(body["counts"]["requests"], 0);

    for _ in 0..3 {
        let _ = gateway
            .handle("payment", "ip:1", ProxyRequest::new(Method::GET, "/api/payment"))
            .await;
    }

    let body: Value = server.get("/admin/circuitbreaker/payment").await.json();
    assert_eq!(body["state"], "open");

    let list: Value = server.get("/admin/circuitbreaker").await.json();
    assert_eq!(list["total_count"], 1);

    let response = server.post("/admin/circuitbreaker/payment/reset").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["new_state"], "closed");

    let body: Value = server.get("/admin/circuitbreaker/payment").await.json();
    assert_eq!(body["state"], "closed");
    assert_eq!(body["counts"]["total_failures"], 0);

    let unknown = server.get("/admin/circuitbreaker/shipping").await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
    let unknown = server.post("/admin/circuitbreaker/shipping/reset").await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limit_status_and_reset() {
    let gateway = gateway(true);
    let server = test_server(gateway.clone());
    let limiter = gateway.limiter().unwrap().clone();

    for _ in 0..3 {
        limiter.check_rate_limit("user:42").await.unwrap();
    }

    let response = server.get("/admin/ratelimit/user:42").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["count"], 3);
    assert_eq!(body["remaining"], 2);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["window"], "1m");

    let response = server.delete("/admin/ratelimit/user:42").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["identifier"], "user:42");

    let body: Value = server.get("/admin/ratelimit/user:42").await.json();
    assert_eq!(body["count"], 0);
    assert_eq!(body["remaining"], 5);
}

#[tokio::test]
async fn test_rate_limit_routes_without_limiter() {
    let server = test_server(gateway(false));

    let response = server.get("/admin/ratelimit/user:42").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["error"], "rate_limiting_disabled");
}
