//! # Rate Limiting
//!
//! Sliding-window limiting keyed per caller, with the window kept in a shared
//! store so every gateway node sees the same counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod cleanup;
pub mod limiter;
pub mod stores;

pub use cleanup::RateLimitCleanupTask;
pub use limiter::{CleanupReport, RateLimitResult, RateLimitStatus, SlidingWindowRateLimiter};
pub use stores::{build_store, MemoryStore, RateLimitError, RateLimitStore, RedisStore};

/// What to do when the store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Reject with 503
    Closed,
}

/// Where windows are kept
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Redis { url: String },
}

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Requests admitted per window per identifier
    pub max_requests: u64,

    pub key_prefix: String,

    pub failure_policy: FailurePolicy,

    /// How often stale windows are swept
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    pub storage: StorageConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
            key_prefix: "rate_limit".to_string(),
            failure_policy: FailurePolicy::Open,
            cleanup_interval: Duration::from_secs(300),
            storage: StorageConfig::Memory,
        }
    }
}
