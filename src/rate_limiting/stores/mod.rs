//! Storage backends for the sliding-window rate limiter.
//!
//! The limiter never reads-then-writes a window itself. The whole
//! prune/count/insert step is one [`RateLimitStore::sliding_window`] call,
//! and each store makes that call atomic in its own way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::rate_limiting::StorageConfig;

/// Errors raised by a rate-limit store
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Input to one atomic sliding-window step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Current time, unix milliseconds
    pub now_ms: i64,
    pub window_ms: i64,
    pub max_requests: u64,
    /// Insert `member` when admitted; `false` only inspects the window
    pub record: bool,
    /// Unique sorted-set member, `<now_ms>-<random>`
    pub member: String,
    /// Key TTL refreshed on insert
    pub ttl: Duration,
}

/// Result of one sliding-window step, taken before any insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Entries in the window after pruning
    pub count: u64,
    /// Score of the oldest surviving entry
    pub oldest_ms: Option<i64>,
}

/// Shared store contract
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RateLimitError>;
    async fn delete(&self, key: &str) -> Result<(), RateLimitError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), RateLimitError>;

    /// Atomically prune entries with score <= `now - window`, count the
    /// rest and, if below the limit and `record` is set, insert the member
    async fn sliding_window(&self, key: &str, request: &WindowRequest) -> Result<WindowOutcome, RateLimitError>;

    /// Keys beginning with `prefix`
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, RateLimitError>;

    /// Drop entries with score <= `window_start_ms`, deleting the key if it
    /// ends up empty. Returns the entries left.
    async fn prune(&self, key: &str, window_start_ms: i64) -> Result<u64, RateLimitError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Build the configured store
pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn RateLimitStore>, RateLimitError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::Redis { url } => Ok(Arc::new(RedisStore::connect(url).await?)),
    }
}
