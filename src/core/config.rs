//! # Configuration Module
//!
//! Gateway configuration is a single YAML document, optionally overridden by
//! `GATEWAY_*` environment variables, validated once at startup.
//!
//! ## Key Features
//! - YAML parsing with serde, durations in humantime form (`30s`, `5m`)
//! - Environment variable override support
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::circuit_breaker::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::strategies::BalancingStrategy;
use crate::observability::logging::{LogFormat, LoggingConfig};
use crate::observability::metrics::MetricsConfig;
use crate::proxy::{PathRewrite, ProxyConfig};
use crate::rate_limiting::{RateLimitConfig, StorageConfig};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Configuration file used when `GATEWAY_CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener settings
    pub server: ServerConfig,

    /// Log level and format
    pub logging: LoggingConfig,

    /// Prometheus exporter settings
    pub metrics: MetricsConfig,

    /// Sliding-window rate limiter settings
    pub rate_limit: RateLimitConfig,

    /// Upstream services keyed by name
    pub services: HashMap<String, ServiceConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the proxy listener binds to
    pub bind_address: String,

    /// Address the admin listener binds to
    pub admin_bind_address: String,

    /// Maximum inbound request body in bytes
    pub max_body_size: usize,

    /// Overall deadline for one inbound request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Peers whose `X-Forwarded-For` is believed
    pub trusted_proxies: Vec<IpAddr>,

    /// Key callers on `X-User-Id`; only safe behind an auth layer that sets it
    pub trust_user_id_header: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            admin_bind_address: "127.0.0.1:9090".to_string(),
            max_body_size: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            trusted_proxies: Vec::new(),
            trust_user_id_header: false,
        }
    }
}

/// One upstream service and everything the gateway does for it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Inbound path prefix routed to this service, e.g. `/api/basket`
    pub path_prefix: String,

    /// Backend selection strategy
    pub strategy: BalancingStrategy,

    /// Initial backends
    pub backends: Vec<BackendConfig>,

    /// Breaker guarding calls to this service
    pub circuit_breaker: CircuitBreakerConfig,

    /// How requests are forwarded
    pub proxy: ProxyConfig,

    /// Active health checking
    pub health_check: HealthCheckConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/".to_string(),
            strategy: BalancingStrategy::RoundRobin,
            backends: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            proxy: ProxyConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// A configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Active health check settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    /// Path probed on every backend
    pub path: String,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path from `GATEWAY_CONFIG_PATH` and load it
    pub async fn load() -> GatewayResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_file(path).await
    }

    /// Parse a YAML document without overrides or validation
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content).map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(addr) = lookup("GATEWAY_ADMIN_BIND_ADDRESS") {
            self.server.admin_bind_address = addr;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(GatewayError::config(format!("Invalid GATEWAY_LOG_FORMAT: {}", other)));
                }
            };
        }

        if let Some(url) = lookup("GATEWAY_REDIS_URL") {
            self.rate_limit.storage = StorageConfig::Redis { url };
        }

        if let Some(max) = lookup("GATEWAY_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = max
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_MAX_REQUESTS: {}", e)))?;
        }

        if let Some(window) = lookup("GATEWAY_RATE_LIMIT_WINDOW") {
            self.rate_limit.window = humantime::parse_duration(&window)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RATE_LIMIT_WINDOW: {}", e)))?;
        }

        Ok(())
    }

    /// Validate the whole document, reporting every problem found
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }
        if self.server.admin_bind_address.is_empty() {
            errors.push("server.admin_bind_address cannot be empty".to_string());
        }
        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }
        if self.server.request_timeout.is_zero() {
            errors.push("server.request_timeout must be greater than 0".to_string());
        }

        let rate_limit = &self.rate_limit;
        if rate_limit.enabled {
            if rate_limit.window.as_millis() == 0 {
                errors.push("rate_limit.window must be at least 1ms".to_string());
            }
            if rate_limit.max_requests == 0 {
                errors.push("rate_limit.max_requests must be greater than 0".to_string());
            }
            if rate_limit.key_prefix.is_empty() {
                errors.push("rate_limit.key_prefix cannot be empty".to_string());
            }
            if rate_limit.cleanup_interval.is_zero() {
                errors.push("rate_limit.cleanup_interval must be greater than 0".to_string());
            }
            if let StorageConfig::Redis { url } = &rate_limit.storage {
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    errors.push(format!("rate_limit.storage.url '{}' is not a redis:// URL", url));
                }
            }
        }

        let mut prefixes: HashMap<&str, &str> = HashMap::new();
        for (name, service) in &self.services {
            self.validate_service(name, service, &mut errors);

            if let Some(other) = prefixes.insert(service.path_prefix.as_str(), name.as_str()) {
                errors.push(format!(
                    "Services '{}' and '{}' share path_prefix '{}'",
                    other, name, service.path_prefix
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort();
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }

    fn validate_service(&self, name: &str, service: &ServiceConfig, errors: &mut Vec<String>) {
        if !service.path_prefix.starts_with('/') {
            errors.push(format!("Service '{}' path_prefix must start with '/'", name));
        }

        for backend in &service.backends {
            match Url::parse(&backend.url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
                Ok(_) => errors.push(format!(
                    "Service '{}' backend '{}' must be an absolute http(s) URL",
                    name, backend.url
                )),
                Err(e) => errors.push(format!("Service '{}' backend '{}' is invalid: {}", name, backend.url, e)),
            }
        }

        let breaker = &service.circuit_breaker;
        if breaker.enabled {
            if breaker.max_requests == 0 {
                errors.push(format!("Service '{}' circuit_breaker.max_requests must be greater than 0", name));
            }
            if !(0.0..=1.0).contains(&breaker.failure_ratio) || breaker.failure_ratio == 0.0 {
                errors.push(format!(
                    "Service '{}' circuit_breaker.failure_ratio must be in (0.0, 1.0]",
                    name
                ));
            }
            if breaker.timeout.is_zero() {
                errors.push(format!("Service '{}' circuit_breaker.timeout must be greater than 0", name));
            }
        }

        if service.proxy.timeout.is_zero() {
            errors.push(format!("Service '{}' proxy.timeout must be greater than 0", name));
        }
        let budget = service.proxy.worst_case_duration();
        if budget > self.server.request_timeout {
            errors.push(format!(
                "Service '{}' proxy budget {} ((retries + 1) * timeout + retries * retry_delay) exceeds server.request_timeout {}",
                name,
                humantime::format_duration(budget),
                humantime::format_duration(self.server.request_timeout)
            ));
        }
        match &service.proxy.path_rewrite {
            PathRewrite::Preserve => {}
            PathRewrite::StripPrefix { prefix } if prefix.is_empty() => {
                errors.push(format!("Service '{}' strip_prefix rule has an empty prefix", name));
            }
            PathRewrite::ReplacePrefix { from, .. } if from.is_empty() => {
                errors.push(format!("Service '{}' replace_prefix rule has an empty 'from'", name));
            }
            _ => {}
        }

        if service.health_check.enabled {
            if service.health_check.interval.is_zero() {
                errors.push(format!("Service '{}' health_check.interval must be greater than 0", name));
            }
            if !service.health_check.path.starts_with('/') {
                errors.push(format!("Service '{}' health_check.path must start with '/'", name));
            }
        }
    }
}
