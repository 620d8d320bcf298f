//! # Active Health Checking
//!
//! Every pool with health checking enabled gets probed on its own
//! `tokio::time::interval`: `GET <backend><path>` with a timeout, where any
//! 2xx marks the backend healthy and everything else (other status, transport
//! error, timeout) marks it unhealthy.
//!
//! The checker runs until its `CancellationToken` is cancelled.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use reqwest::Client as HttpClient;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::HealthCheckConfig;
use crate::load_balancing::backend::Backend;
use crate::load_balancing::balancer::LoadBalancer;

/// Result of probing one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub service: String,
    pub backend: String,
    pub healthy: bool,
}

struct HealthTarget {
    pool: Arc<LoadBalancer>,
    config: HealthCheckConfig,
}

/// Periodic prober for a set of pools
pub struct HealthChecker {
    client: HttpClient,
    targets: Vec<HealthTarget>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            client: HttpClient::new(),
            targets: Vec::new(),
        }
    }

    /// Register a pool; ignored when its health checking is disabled
    pub fn add_pool(&mut self, pool: Arc<LoadBalancer>, config: HealthCheckConfig) {
        if config.enabled {
            self.targets.push(HealthTarget { pool, config });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Probe every backend of every registered pool once
    pub async fn check_once(&self) -> Vec<ProbeOutcome> {
        let sweeps = self.targets.iter().map(|target| self.check_target(target));
        join_all(sweeps).await.into_iter().flatten().collect()
    }

    /// Start one probing loop per pool; resolves once `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut loops = JoinSet::new();
            for index in 0..self.targets.len() {
                let checker = self.clone();
                let cancel = cancel.clone();
                loops.spawn(async move { checker.run_target(index, cancel).await });
            }
            while loops.join_next().await.is_some() {}
            info!("Health checker stopped");
        })
    }

    async fn run_target(&self, index: usize, cancel: CancellationToken) {
        let Some(target) = self.targets.get(index) else {
            return;
        };

        let mut ticker = interval(target.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_target(target).await;
                }
            }
        }
    }

    async fn check_target(&self, target: &HealthTarget) -> Vec<ProbeOutcome> {
        let backends = target.pool.backends();
        let probes = backends.iter().map(|backend| self.probe(backend, &target.config));
        let results = join_all(probes).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for (backend, healthy) in backends.iter().zip(results) {
            let url = backend.url().to_string();
            // The backend may have been removed while the probe was in flight.
            if target.pool.set_backend_health(&url, healthy).is_err() {
                continue;
            }
            outcomes.push(ProbeOutcome {
                service: target.pool.service().to_string(),
                backend: url,
                healthy,
            });
        }
        outcomes
    }

    async fn probe(&self, backend: &Backend, config: &HealthCheckConfig) -> bool {
        let url = health_url(backend.url(), &config.path);
        let start = Instant::now();

        match timeout(config.timeout, self.client.get(url.clone()).send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!(backend = %url, elapsed_ms = start.elapsed().as_millis() as u64, "Health probe passed");
                true
            }
            Ok(Ok(response)) => {
                warn!(backend = %url, status = response.status().as_u16(), "Health probe returned non-2xx");
                false
            }
            Ok(Err(e)) => {
                warn!(backend = %url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                warn!(backend = %url, timeout = ?config.timeout, "Health probe timed out");
                false
            }
        }
    }
}

/// Append `path` to the backend's base path
fn health_url(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancing::strategies::BalancingStrategy;
    use crate::observability::metrics::noop;
    use axum::{http::StatusCode, routing::get, Router};
    use std::time::Duration;

    async fn spawn_backend(status: StatusCode) -> String {
        let app = Router::new().route("/health", get(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[test]
    fn test_health_url_keeps_base_path() {
        let base = Url::parse("http://basket:8080/v1/").unwrap();
        assert_eq!(health_url(&base, "/health").as_str(), "http://basket:8080/v1/health");

        let base = Url::parse("http://basket:8080").unwrap();
        assert_eq!(health_url(&base, "/health").as_str(), "http://basket:8080/health");
    }

    #[tokio::test]
    async fn test_check_once_marks_backends() {
        let up = spawn_backend(StatusCode::OK).await;
        let down = spawn_backend(StatusCode::SERVICE_UNAVAILABLE).await;

        let pool = Arc::new(LoadBalancer::new("basket", BalancingStrategy::RoundRobin, noop()));
        pool.add_backend(&up, 1).unwrap();
        pool.add_backend(&down, 1).unwrap();
        pool.add_backend("http://127.0.0.1:1", 1).unwrap();

        let mut checker = HealthChecker::new();
        checker.add_pool(pool.clone(), config());
        let outcomes = checker.check_once().await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.healthy).count(), 1);
        assert_eq!(pool.get_healthy_backends().len(), 1);
        assert!(pool.backends().iter().all(|b| b.last_health_check().is_some()));
    }

    #[tokio::test]
    async fn test_disabled_pool_is_not_registered() {
        let pool = Arc::new(LoadBalancer::new("basket", BalancingStrategy::RoundRobin, noop()));
        let mut checker = HealthChecker::new();
        checker.add_pool(
            pool,
            HealthCheckConfig {
                enabled: false,
                ..Default::default()
            },
        );
        assert!(checker.is_empty());
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let down = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR).await;
        let pool = Arc::new(LoadBalancer::new("basket", BalancingStrategy::RoundRobin, noop()));
        pool.add_backend(&down, 1).unwrap();

        let mut checker = HealthChecker::new();
        checker.add_pool(pool.clone(), config());
        let cancel = CancellationToken::new();
        let handle = Arc::new(checker).spawn(cancel.clone());

        for _ in 0..100 {
            if pool.get_healthy_backends().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.get_healthy_backends().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
