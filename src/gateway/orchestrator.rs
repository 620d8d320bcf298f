//! # Gateway Orchestrator
//!
//! Composes the traffic engine for one inbound request:
//!
//! 1. rate limit the caller (429 on denial);
//! 2. pick a healthy backend from the service's pool (503 when none);
//! 3. hold a connection guard on it for the rest of the request;
//! 4. forward through the service's circuit breaker, or directly when the
//!    breaker is disabled;
//! 5. map failures onto 502/503/504.
//!
//! Rate-limit headers are attached to every response that went through
//! step 1, whatever its status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::core::config::{GatewayConfig, ServiceConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::LoadBalancer;
use crate::observability::metrics::GatewayMetrics;
use crate::proxy::{ProxyConfig, ProxyRequest, ProxyResponse, ReverseProxy};
use crate::rate_limiting::{RateLimitResult, SlidingWindowRateLimiter};

/// Everything the gateway knows about one service
pub struct ServiceRoute {
    pub name: String,
    pub path_prefix: String,
    pub pool: Arc<LoadBalancer>,
    pub proxy: ProxyConfig,
    pub breaker_enabled: bool,
}

/// Request orchestrator shared by every handler
pub struct Gateway {
    services: BTreeMap<String, ServiceRoute>,
    breakers: Arc<CircuitBreakerManager>,
    limiter: Option<Arc<SlidingWindowRateLimiter>>,
    proxy: ReverseProxy,
    metrics: Arc<dyn GatewayMetrics>,
}

impl Gateway {
    pub fn new(
        proxy: ReverseProxy,
        limiter: Option<Arc<SlidingWindowRateLimiter>>,
        metrics: Arc<dyn GatewayMetrics>,
    ) -> Self {
        Self {
            services: BTreeMap::new(),
            breakers: Arc::new(CircuitBreakerManager::new(metrics.clone())),
            limiter,
            proxy,
            metrics,
        }
    }

    /// Build pools and breakers for every configured service
    pub fn from_config(
        config: &GatewayConfig,
        limiter: Option<Arc<SlidingWindowRateLimiter>>,
        metrics: Arc<dyn GatewayMetrics>,
    ) -> GatewayResult<Self> {
        let mut gateway = Self::new(ReverseProxy::new()?, limiter, metrics);
        for (name, service) in &config.services {
            gateway.add_service(name, service)?;
        }
        Ok(gateway)
    }

    /// Register a service from its configuration
    pub fn add_service(&mut self, name: &str, config: &ServiceConfig) -> GatewayResult<Arc<LoadBalancer>> {
        let pool = Arc::new(LoadBalancer::from_config(name, config, self.metrics.clone())?);
        self.add_service_pool(
            name,
            &config.path_prefix,
            pool.clone(),
            config.proxy.clone(),
            config.circuit_breaker.clone(),
        );
        Ok(pool)
    }

    /// Register a service around an existing pool
    pub fn add_service_pool(
        &mut self,
        name: &str,
        path_prefix: &str,
        pool: Arc<LoadBalancer>,
        proxy: ProxyConfig,
        breaker: CircuitBreakerConfig,
    ) {
        let breaker_enabled = breaker.enabled;
        if breaker_enabled {
            self.breakers.create_breaker(name, breaker);
        }
        self.services.insert(
            name.to_string(),
            ServiceRoute {
                name: name.to_string(),
                path_prefix: path_prefix.to_string(),
                pool,
                proxy,
                breaker_enabled,
            },
        );
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn limiter(&self) -> Option<&Arc<SlidingWindowRateLimiter>> {
        self.limiter.as_ref()
    }

    pub fn service(&self, name: &str) -> GatewayResult<&ServiceRoute> {
        self.services.get(name).ok_or_else(|| GatewayError::service_not_found(name))
    }

    pub fn pool(&self, name: &str) -> GatewayResult<Arc<LoadBalancer>> {
        Ok(self.service(name)?.pool.clone())
    }

    /// Services in name order
    pub fn services(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.services.values()
    }

    /// Service whose `path_prefix` is the longest match for `path`
    pub fn resolve_service(&self, path: &str) -> Option<&str> {
        self.services
            .values()
            .filter(|route| prefix_matches(path, &route.path_prefix))
            .max_by_key(|route| route.path_prefix.len())
            .map(|route| route.name.as_str())
    }

    /// Run one request through rate limiting, selection, breaking and proxying
    pub async fn handle(&self, service: &str, identifier: &str, request: ProxyRequest) -> Response {
        let start = Instant::now();

        let rate = match &self.limiter {
            Some(limiter) if limiter.config().enabled => match limiter.check_rate_limit(identifier).await {
                Ok(result) => Some(result),
                Err(e) => return self.finish(service, start, e.into_response(), None),
            },
            _ => None,
        };

        if let Some(result) = rate.as_ref().filter(|r| !r.allowed) {
            debug!(service, identifier, "Request rate limited");
            return self.finish(service, start, rate_limited_response(result), rate.as_ref());
        }

        let response = match self.forward(service, request).await {
            Ok(response) => response.into_response(),
            Err(e) => e.into_response(),
        };
        self.finish(service, start, response, rate.as_ref())
    }

    async fn forward(&self, service: &str, request: ProxyRequest) -> GatewayResult<ProxyResponse> {
        let route = self.service(service)?;
        let backend = route.pool.select_backend()?;
        let mut guard = route.pool.acquire(&backend);

        let result = if route.breaker_enabled {
            let proxy = &self.proxy;
            let url = backend.url().clone();
            let config = &route.proxy;
            self.breakers
                .execute_classified(
                    &route.name,
                    || async move { proxy.proxy(request, &url, config).await },
                    |result| matches!(result, Ok(response) if !response.status.is_server_error()),
                )
                .await
        } else {
            self.proxy.proxy(request, backend.url(), &route.proxy).await
        };

        match &result {
            Ok(_) => guard.mark_success(),
            Err(e) => {
                warn!(service, backend = %backend.url(), error = %e, "Request to backend failed");
                guard.mark_failure();
            }
        }

        result
    }

    fn finish(&self, service: &str, start: Instant, mut response: Response, rate: Option<&RateLimitResult>) -> Response {
        if let Some(rate) = rate {
            let headers = response.headers_mut();
            for (name, value) in rate.headers() {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(HeaderName::from_static(name), value);
                }
            }
        }
        self.metrics
            .record_proxy_request(service, response.status().as_u16(), start.elapsed());
        response
    }
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn rate_limited_response(result: &RateLimitResult) -> Response {
    let retry_after = result.retry_after_secs();
    let body = json!({
        "error": {
            "code": StatusCode::TOO_MANY_REQUESTS.as_u16(),
            "message": "Rate limit exceeded",
            "type": "rate_limited",
            "retry_after": retry_after,
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
