// Structured logging
pub mod logging;

// Metrics collection and Prometheus export
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{GatewayMetrics, MetricsConfig, NoopMetrics, PrometheusMetrics};
