//! # Error Handling Module
//!
//! Every fallible operation in the gateway returns [`GatewayResult`]. The
//! variants map one-to-one onto the failure modes of the traffic engine (pool,
//! breaker, proxy, rate-limit store) plus a few ambient ones for configuration
//! and I/O.
//!
//! Errors are plain data: they are `Clone`, can be logged, and convert into an
//! HTTP response through [`IntoResponse`]. The response body is built from
//! [`GatewayError::public_message`], which never contains backend URLs; the
//! detailed `Display` text is for logs only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the gateway
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// A backend URL could not be parsed or is not an absolute http(s) URL
    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    /// No backend with the given URL exists in the pool
    #[error("Backend not found: {url}")]
    BackendNotFound { url: String },

    /// The pool for a service is empty
    #[error("No backends available for service: {service}")]
    NoBackendsAvailable { service: String },

    /// The pool has backends but none of them is healthy
    #[error("No healthy backends for service: {service}")]
    NoHealthyBackends { service: String },

    /// The breaker guarding a service rejected the call
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String },

    /// No breaker registered under this name
    #[error("Circuit breaker not found: {name}")]
    BreakerNotFound { name: String },

    /// The single proxy attempt timed out
    #[error("Proxy request timed out after {timeout_ms}ms")]
    ProxyTimeout { timeout_ms: u64 },

    /// Every proxy attempt failed at the transport level
    #[error("Proxy failed after {attempts} attempts: {last_error}")]
    ProxyExhaustedRetries { attempts: u32, last_error: String },

    /// The shared rate-limit store could not be reached
    #[error("Rate limit store unavailable: {message}")]
    RateLimitStoreUnavailable { message: String },

    /// No service is configured under this name or path
    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid backend URL error
    pub fn invalid_backend_url<U: Into<String>, R: Into<String>>(url: U, reason: R) -> Self {
        Self::InvalidBackendUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend not found error
    pub fn backend_not_found<S: Into<String>>(url: S) -> Self {
        Self::BackendNotFound { url: url.into() }
    }

    /// Create a breaker not found error
    pub fn breaker_not_found<S: Into<String>>(name: S) -> Self {
        Self::BreakerNotFound { name: name.into() }
    }

    /// Create a service not found error
    pub fn service_not_found<S: Into<String>>(service: S) -> Self {
        Self::ServiceNotFound {
            service: service.into(),
        }
    }

    /// Create a rate limit store error
    pub fn store_unavailable<S: Into<String>>(message: S) -> Self {
        Self::RateLimitStoreUnavailable {
            message: message.into(),
        }
    }

    /// HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBackendUrl { .. } => StatusCode::BAD_REQUEST,
            Self::BackendNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoBackendsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoHealthyBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BreakerNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ProxyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ProxyExhaustedRetries { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimitStoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to callers.
    ///
    /// Pool and breaker errors collapse into generic availability messages so
    /// that backend addresses and trip causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::NoBackendsAvailable { .. } | Self::NoHealthyBackends { .. } => {
                "Service not available".to_string()
            }
            Self::CircuitOpen { .. } => "Service temporarily unavailable".to_string(),
            Self::ProxyTimeout { .. } => "Upstream service timed out".to_string(),
            Self::ProxyExhaustedRetries { .. } => "Upstream service unreachable".to_string(),
            Self::RateLimitStoreUnavailable { .. } => "Service temporarily unavailable".to_string(),
            Self::Configuration { .. } | Self::Internal { .. } | Self::Io { .. } | Self::Yaml { .. } => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the failure indicates the upstream is unhealthy
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::ProxyTimeout { .. } | Self::ProxyExhaustedRetries { .. }
        )
    }

    /// String tag for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidBackendUrl { .. } => "invalid_backend_url",
            Self::BackendNotFound { .. } => "backend_not_found",
            Self::NoBackendsAvailable { .. } => "no_backends_available",
            Self::NoHealthyBackends { .. } => "no_healthy_backends",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BreakerNotFound { .. } => "breaker_not_found",
            Self::ProxyTimeout { .. } => "proxy_timeout",
            Self::ProxyExhaustedRetries { .. } => "proxy_exhausted_retries",
            Self::RateLimitStoreUnavailable { .. } => "rate_limit_store_unavailable",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.public_message(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
