//! # Metrics Collection
//!
//! Components never touch a global registry directly. Each one receives an
//! `Arc<dyn GatewayMetrics>` at construction and reports events through it.
//!
//! - [`PrometheusMetrics`] forwards events to the `metrics` facade, which the
//!   binary backs with the Prometheus exporter.
//! - [`NoopMetrics`] discards everything (tests, benchmarks).
//!
//! ## Usage Example
//! ```rust,ignore
//! let metrics: Arc<dyn GatewayMetrics> = Arc::new(PrometheusMetrics::new());
//! let balancer = LoadBalancer::new("basket", BalancingStrategy::RoundRobin, metrics.clone());
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use crate::core::circuit_breaker::CircuitState;
use crate::core::error::{GatewayError, GatewayResult};

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and expose `/metrics` on the admin listener
    pub prometheus_enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
        }
    }
}

/// Sink for traffic-engine events
pub trait GatewayMetrics: Send + Sync {
    /// A backend was picked by a pool
    fn record_backend_selected(&self, service: &str, backend: &str);

    /// A proxied call to a backend failed
    fn record_backend_failure(&self, service: &str, backend: &str);

    /// Current in-flight request count for a backend
    fn set_active_connections(&self, service: &str, backend: &str, active: u64);

    /// A circuit breaker moved between states
    fn record_circuit_state_change(&self, name: &str, from: CircuitState, to: CircuitState);

    /// Outcome of a rate-limit check
    fn record_rate_limit_decision(&self, allowed: bool);

    /// The shared rate-limit store returned an error
    fn record_rate_limit_store_error(&self);

    /// A request finished on the proxy path
    fn record_proxy_request(&self, service: &str, status: u16, latency: Duration);
}

/// Forwards events to the `metrics` facade
#[derive(Debug, Default, Clone)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Install the global Prometheus recorder; call once from the binary
    pub fn install_recorder() -> GatewayResult<PrometheusHandle> {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::internal(format!("Failed to install Prometheus recorder: {}", e)))
    }
}

impl GatewayMetrics for PrometheusMetrics {
    fn record_backend_selected(&self, service: &str, backend: &str) {
        counter!(
            "gateway_backend_selections_total",
            "service" => service.to_string(),
            "backend" => backend.to_string()
        )
        .increment(1);
    }

    fn record_backend_failure(&self, service: &str, backend: &str) {
        counter!(
            "gateway_backend_failures_total",
            "service" => service.to_string(),
            "backend" => backend.to_string()
        )
        .increment(1);
    }

    fn set_active_connections(&self, service: &str, backend: &str, active: u64) {
        gauge!(
            "gateway_backend_active_connections",
            "service" => service.to_string(),
            "backend" => backend.to_string()
        )
        .set(active as f64);
    }

    fn record_circuit_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        counter!(
            "gateway_circuit_breaker_transitions_total",
            "breaker" => name.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        gauge!("gateway_circuit_breaker_state", "breaker" => name.to_string()).set(to.as_gauge());
    }

    fn record_rate_limit_decision(&self, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        counter!("gateway_rate_limit_decisions_total", "outcome" => outcome).increment(1);
    }

    fn record_rate_limit_store_error(&self) {
        counter!("gateway_rate_limit_store_errors_total").increment(1);
    }

    fn record_proxy_request(&self, service: &str, status: u16, latency: Duration) {
        counter!(
            "gateway_proxy_requests_total",
            "service" => service.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!("gateway_proxy_request_duration_seconds", "service" => service.to_string())
            .record(latency.as_secs_f64());
    }
}

/// Discards every event
#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

impl GatewayMetrics for NoopMetrics {
    fn record_backend_selected(&self, _service: &str, _backend: &str) {}
    fn record_backend_failure(&self, _service: &str, _backend: &str) {}
    fn set_active_connections(&self, _service: &str, _backend: &str, _active: u64) {}
    fn record_circuit_state_change(&self, _name: &str, _from: CircuitState, _to: CircuitState) {}
    fn record_rate_limit_decision(&self, _allowed: bool) {}
    fn record_rate_limit_store_error(&self) {}
    fn record_proxy_request(&self, _service: &str, _status: u16, _latency: Duration) {}
}

/// Shared no-op collector
pub fn noop() -> Arc<dyn GatewayMetrics> {
    Arc::new(NoopMetrics)
}
