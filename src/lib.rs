//! # Traffic Gateway
//!
//! Traffic-management core for the e-commerce API gateway. Requests are
//! matched to an upstream service by path prefix, admitted by a sliding-window
//! rate limiter, guarded by a per-service circuit breaker, balanced across a
//! pool of backends and forwarded by a retrying reverse proxy.
//!
//! ## Module layout
//! - `core`: errors, configuration, circuit breakers
//! - `load_balancing`: backend pools, selection strategies, active health checks
//! - `rate_limiting`: sliding-window limiter over a pluggable store (memory or Redis)
//! - `proxy`: HTTP forwarding with header hygiene and retries
//! - `gateway`: the request orchestrator and HTTP listeners
//! - `admin`: operator endpoints
//! - `observability`: logging and metrics

/// Errors, configuration and circuit breakers
pub mod core;

/// Request orchestration and the HTTP listeners
pub mod gateway;

/// Backend pools and selection strategies
pub mod load_balancing;

/// Distributed sliding-window rate limiting
pub mod rate_limiting;

/// Upstream forwarding
pub mod proxy;

/// Logging and metrics
pub mod observability;

/// Operator REST API
pub mod admin;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
