//! Upstream backend with lock-free live counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crate::observability::metrics::GatewayMetrics;

/// One upstream instance of a service
#[derive(Debug)]
pub struct Backend {
    url: Url,
    weight: u32,

    active_connections: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl Backend {
    /// A new backend starts healthy with zero counters
    pub fn new(url: Url, weight: u32) -> Self {
        Self {
            url,
            weight,
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock()
    }

    /// Returns the new active count
    pub fn increment_connections(&self) -> u64 {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturating decrement; returns the new active count
    pub fn decrement_connections(&self) -> u64 {
        let mut current = self.active_connections.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.active_connections.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the health flag and stamp the check time
    pub fn set_health(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        *self.last_health_check.lock() = Some(Utc::now());
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            url: self.url.to_string(),
            weight: self.weight,
            healthy: self.is_healthy(),
            active_connections: self.active_connections(),
            total_requests: self.total_requests(),
            failed_requests: self.failed_requests(),
            last_health_check: self.last_health_check(),
        }
    }
}

/// Serializable snapshot of a backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Holds one active connection on a backend for its lifetime.
///
/// Dropping the guard releases the connection. If neither `mark_success`
/// nor `mark_failure` was called first (the request future was cancelled or
/// panicked) a failed request is recorded as well. A guard built with
/// `with_metrics` also reports the failure and the released connection.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
    outcome: Option<bool>,
    reporter: Option<GuardReporter>,
}

struct GuardReporter {
    service: String,
    metrics: Arc<dyn GatewayMetrics>,
}

impl ConnectionGuard {
    /// Increment the backend's active count and return the guard
    pub fn acquire(backend: &Arc<Backend>) -> Self {
        backend.increment_connections();
        Self {
            backend: backend.clone(),
            outcome: None,
            reporter: None,
        }
    }

    /// Like `acquire`, reporting the connection gauge and failures for `service`
    pub fn with_metrics(backend: &Arc<Backend>, service: &str, metrics: Arc<dyn GatewayMetrics>) -> Self {
        let active = backend.increment_connections();
        metrics.set_active_connections(service, backend.url().as_str(), active);
        Self {
            backend: backend.clone(),
            outcome: None,
            reporter: Some(GuardReporter {
                service: service.to_string(),
                metrics,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn mark_success(&mut self) {
        self.outcome = Some(true);
    }

    pub fn mark_failure(&mut self) {
        if self.outcome != Some(false) {
            self.record_failure();
        }
        self.outcome = Some(false);
    }

    fn record_failure(&self) {
        self.backend.record_failure();
        if let Some(reporter) = &self.reporter {
            reporter
                .metrics
                .record_backend_failure(&reporter.service, self.backend.url().as_str());
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("backend", &self.backend.url().as_str())
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.record_failure();
        }
        let active = self.backend.decrement_connections();
        if let Some(reporter) = &self.reporter {
            reporter
                .metrics
                .set_active_connections(&reporter.service, self.backend.url().as_str(), active);
        }
    }
}
