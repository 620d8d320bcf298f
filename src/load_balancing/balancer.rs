//! # Load Balancer Module
//!
//! A [`LoadBalancer`] is the backend pool of one logical service. The pool's
//! structure (which backends exist) sits behind a `parking_lot::RwLock`: add
//! and remove take the write lock, selection and stats take a read lock just
//! long enough to snapshot the `Arc<Backend>` list. Per-backend counters are
//! atomics and are updated without any lock.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! let lb = LoadBalancer::new("basket", BalancingStrategy::RoundRobin, metrics);
//! lb.add_backend("http://basket-1:8080", 1)?;
//! let backend = lb.select_backend()?;
//! let guard = lb.acquire(&backend);
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::core::config::ServiceConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::backend::{Backend, BackendStats, ConnectionGuard};
use crate::load_balancing::strategies::BalancingStrategy;
use crate::observability::metrics::GatewayMetrics;

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub service: String,
    pub strategy: BalancingStrategy,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_connections: u64,
    pub backends: Vec<BackendStats>,
}

/// Backend pool for one service
pub struct LoadBalancer {
    service: String,
    strategy: BalancingStrategy,
    backends: RwLock<Vec<Arc<Backend>>>,
    cursor: AtomicU64,
    metrics: Arc<dyn GatewayMetrics>,
}

impl LoadBalancer {
    /// Create an empty pool
    pub fn new(service: impl Into<String>, strategy: BalancingStrategy, metrics: Arc<dyn GatewayMetrics>) -> Self {
        Self {
            service: service.into(),
            strategy,
            backends: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
            metrics,
        }
    }

    /// Create a pool holding every backend in the service config
    pub fn from_config(service: &str, config: &ServiceConfig, metrics: Arc<dyn GatewayMetrics>) -> GatewayResult<Self> {
        let lb = Self::new(service, config.strategy, metrics);
        for backend in &config.backends {
            lb.add_backend(&backend.url, backend.weight)?;
        }
        Ok(lb)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.strategy
    }

    /// Add a healthy backend with zero counters
    pub fn add_backend(&self, url: &str, weight: u32) -> GatewayResult<Arc<Backend>> {
        let parsed = parse_backend_url(url)?;

        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.url() == &parsed) {
            return Err(GatewayError::invalid_backend_url(url, "backend already registered"));
        }

        let backend = Arc::new(Backend::new(parsed, weight));
        backends.push(backend.clone());
        drop(backends);

        info!(service = %self.service, backend = %url, weight, "Backend added");
        Ok(backend)
    }

    /// Remove a backend; in-flight requests keep their `Arc` until done
    pub fn remove_backend(&self, url: &str) -> GatewayResult<()> {
        let mut backends = self.backends.write();
        let index = backends
            .iter()
            .position(|b| url_matches(b, url))
            .ok_or_else(|| GatewayError::backend_not_found(url))?;
        backends.remove(index);
        drop(backends);

        info!(service = %self.service, backend = %url, "Backend removed");
        Ok(())
    }

    /// Pick a healthy backend using the pool's strategy
    pub fn select_backend(&self) -> GatewayResult<Arc<Backend>> {
        let healthy: Vec<Arc<Backend>> = {
            let backends = self.backends.read();
            if backends.is_empty() {
                return Err(GatewayError::NoBackendsAvailable {
                    service: self.service.clone(),
                });
            }
            backends.iter().filter(|b| b.is_healthy()).cloned().collect()
        };

        let backend = self
            .strategy
            .select(&healthy, &self.cursor)
            .ok_or_else(|| GatewayError::NoHealthyBackends {
                service: self.service.clone(),
            })?;

        backend.record_request();
        self.metrics.record_backend_selected(&self.service, backend.url().as_str());
        debug!(
            service = %self.service,
            backend = %backend.url(),
            strategy = %self.strategy,
            "Backend selected"
        );
        Ok(backend)
    }

    /// Scoped connection accounting; the guard decrements and reports on drop
    pub fn acquire(&self, backend: &Arc<Backend>) -> ConnectionGuard {
        ConnectionGuard::with_metrics(backend, &self.service, self.metrics.clone())
    }

    pub fn increment_connection(&self, backend: &Backend) {
        let active = backend.increment_connections();
        self.metrics.set_active_connections(&self.service, backend.url().as_str(), active);
    }

    pub fn decrement_connection(&self, backend: &Backend) {
        let active = backend.decrement_connections();
        self.metrics.set_active_connections(&self.service, backend.url().as_str(), active);
    }

    pub fn increment_failed_request(&self, backend: &Backend) {
        backend.record_failure();
        self.metrics.record_backend_failure(&self.service, backend.url().as_str());
    }

    /// Set a backend's health flag by URL
    pub fn set_backend_health(&self, url: &str, healthy: bool) -> GatewayResult<()> {
        let backend = self
            .find_backend(url)
            .ok_or_else(|| GatewayError::backend_not_found(url))?;

        let was_healthy = backend.is_healthy();
        backend.set_health(healthy);
        if was_healthy != healthy {
            info!(service = %self.service, backend = %url, healthy, "Backend health changed");
        }
        Ok(())
    }

    pub fn find_backend(&self, url: &str) -> Option<Arc<Backend>> {
        self.backends.read().iter().find(|b| url_matches(b, url)).cloned()
    }

    /// Snapshot of every backend
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn get_healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().iter().filter(|b| b.is_healthy()).cloned().collect()
    }

    pub fn get_total_backends(&self) -> usize {
        self.backends.read().len()
    }

    pub fn get_stats(&self) -> LoadBalancerStats {
        let backends: Vec<BackendStats> = self.backends().iter().map(|b| b.stats()).collect();

        LoadBalancerStats {
            service: self.service.clone(),
            strategy: self.strategy,
            total_backends: backends.len(),
            healthy_backends: backends.iter().filter(|b| b.healthy).count(),
            total_requests: backends.iter().map(|b| b.total_requests).sum(),
            failed_requests: backends.iter().map(|b| b.failed_requests).sum(),
            active_connections: backends.iter().map(|b| b.active_connections).sum(),
            backends,
        }
    }
}

fn parse_backend_url(url: &str) -> GatewayResult<Url> {
    let parsed = Url::parse(url).map_err(|e| GatewayError::invalid_backend_url(url, e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::invalid_backend_url(
            url,
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    if parsed.host().is_none() {
        return Err(GatewayError::invalid_backend_url(url, "missing host"));
    }
    Ok(parsed)
}

// Accepts both "http://host:80" and the normalized "http://host:80/".
fn url_matches(backend: &Backend, url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => backend.url() == &parsed,
        Err(_) => backend.url().as_str() == url,
    }
}
