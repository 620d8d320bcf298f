//! Sliding-window rate limiter.
//!
//! Per check, with `now` in unix milliseconds:
//!
//! 1. entries scored at or before `now - window` are dropped;
//! 2. the rest are counted;
//! 3. at the limit the request is denied and told when the oldest entry
//!    leaves the window;
//! 4. otherwise `<now>-<random>` is inserted and the key TTL refreshed.
//!
//! Steps 1-4 are a single store call. The limiter itself keeps no state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics::GatewayMetrics;
use crate::rate_limiting::stores::{RateLimitError, RateLimitStore, WindowOutcome, WindowRequest};
use crate::rate_limiting::{FailurePolicy, RateLimitConfig};

/// Extra key lifetime beyond the window
const TTL_SLACK: Duration = Duration::from_secs(1);

/// Decision for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    /// Unix seconds at which the oldest counted request leaves the window
    pub reset_time: i64,
    /// How long a denied caller should wait; zero when allowed
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
    pub limit: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitResult {
    /// `Retry-After` value: whole seconds, rounded up, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }

    /// `X-RateLimit-*` headers describing this decision
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset_time.to_string()),
            ("x-ratelimit-window", self.window.as_secs().to_string()),
        ]
    }
}

/// Read-only view of an identifier's window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub identifier: String,
    pub count: u64,
    pub remaining: u64,
    pub limit: u64,
    pub reset_time: i64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Totals from one cleanup sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub keys_scanned: usize,
    pub keys_deleted: usize,
    pub errors: usize,
}

/// Distributed sliding-window limiter
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    metrics: Arc<dyn GatewayMetrics>,
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>, metrics: Arc<dyn GatewayMetrics>) -> Self {
        Self { config, store, metrics }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Store key for an identifier, `<prefix>:<identifier>`
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.config.key_prefix, identifier)
    }

    /// Count this request against `identifier` and decide
    pub async fn check_rate_limit(&self, identifier: &str) -> GatewayResult<RateLimitResult> {
        let now_ms = Utc::now().timestamp_millis();
        let request = self.window_request(now_ms, true);

        let outcome = match self.store.sliding_window(&self.key(identifier), &request).await {
            Ok(outcome) => outcome,
            Err(e) => return self.on_store_error(identifier, e, now_ms),
        };

        let result = self.decide(&outcome, now_ms);
        self.metrics.record_rate_limit_decision(result.allowed);
        if result.allowed {
            debug!(identifier, remaining = result.remaining, "Rate limit check passed");
        } else {
            debug!(identifier, retry_after_ms = result.retry_after.as_millis() as u64, "Rate limit exceeded");
        }
        Ok(result)
    }

    /// Inspect `identifier`'s window without counting a request
    pub async fn get_status(&self, identifier: &str) -> GatewayResult<RateLimitStatus> {
        let now_ms = Utc::now().timestamp_millis();
        let request = self.window_request(now_ms, false);

        let outcome = self
            .store
            .sliding_window(&self.key(identifier), &request)
            .await
            .map_err(|e| self.store_error(e))?;

        Ok(RateLimitStatus {
            identifier: identifier.to_string(),
            count: outcome.count,
            remaining: self.config.max_requests.saturating_sub(outcome.count),
            limit: self.config.max_requests,
            reset_time: self.reset_time(&outcome, now_ms),
            window: self.config.window,
        })
    }

    /// Forget every request recorded for `identifier`
    pub async fn reset(&self, identifier: &str) -> GatewayResult<()> {
        self.store
            .delete(&self.key(identifier))
            .await
            .map_err(|e| self.store_error(e))?;
        info!(identifier, "Rate limit reset");
        Ok(())
    }

    /// Prune stale entries from every window and drop windows left empty
    pub async fn cleanup_expired_entries(&self) -> GatewayResult<CleanupReport> {
        let prefix = format!("{}:", self.config.key_prefix);
        let keys = self.store.scan_keys(&prefix).await.map_err(|e| self.store_error(e))?;
        let window_start = Utc::now().timestamp_millis() - self.window_ms();

        let mut report = CleanupReport {
            keys_scanned: keys.len(),
            ..Default::default()
        };
        for key in keys {
            match self.store.prune(&key, window_start).await {
                Ok(0) => report.keys_deleted += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to prune rate limit window");
                    self.metrics.record_rate_limit_store_error();
                    report.errors += 1;
                }
            }
        }

        debug!(
            store = self.store.name(),
            scanned = report.keys_scanned,
            deleted = report.keys_deleted,
            errors = report.errors,
            "Rate limit cleanup finished"
        );
        Ok(report)
    }

    fn window_ms(&self) -> i64 {
        self.config.window.as_millis() as i64
    }

    fn window_request(&self, now_ms: i64, record: bool) -> WindowRequest {
        WindowRequest {
            now_ms,
            window_ms: self.window_ms(),
            max_requests: self.config.max_requests,
            record,
            member: format!("{}-{}", now_ms, rand::random::<u64>()),
            ttl: self.config.window + TTL_SLACK,
        }
    }

    fn decide(&self, outcome: &WindowOutcome, now_ms: i64) -> RateLimitResult {
        let max = self.config.max_requests;
        let (remaining, retry_after) = if outcome.allowed {
            (max.saturating_sub(outcome.count + 1), Duration::ZERO)
        } else {
            let wait_ms = outcome
                .oldest_ms
                .map(|oldest| oldest + self.window_ms() - now_ms)
                .unwrap_or(0)
                .max(0);
            (0, Duration::from_millis(wait_ms as u64))
        };

        RateLimitResult {
            allowed: outcome.allowed,
            remaining,
            reset_time: self.reset_time(outcome, now_ms),
            retry_after,
            limit: max,
            window: self.config.window,
        }
    }

    fn reset_time(&self, outcome: &WindowOutcome, now_ms: i64) -> i64 {
        let reset_ms = outcome.oldest_ms.unwrap_or(now_ms) + self.window_ms();
        reset_ms.div_euclid(1000) + i64::from(reset_ms.rem_euclid(1000) != 0)
    }

    fn on_store_error(&self, identifier: &str, error: RateLimitError, now_ms: i64) -> GatewayResult<RateLimitResult> {
        match self.config.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    identifier,
                    store = self.store.name(),
                    error = %error,
                    "Rate limit store unavailable, allowing request"
                );
                self.metrics.record_rate_limit_store_error();
                self.metrics.record_rate_limit_decision(true);
                let empty = WindowOutcome {
                    allowed: true,
                    count: 0,
                    oldest_ms: None,
                };
                Ok(RateLimitResult {
                    remaining: self.config.max_requests,
                    ..self.decide(&empty, now_ms)
                })
            }
            FailurePolicy::Closed => Err(self.store_error(error)),
        }
    }

    fn store_error(&self, error: RateLimitError) -> GatewayError {
        warn!(store = self.store.name(), error = %error, "Rate limit store error");
        self.metrics.record_rate_limit_store_error();
        GatewayError::store_unavailable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::noop;
    use crate::rate_limiting::stores::MemoryStore;
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn sliding_window(&self, _key: &str, _request: &WindowRequest) -> Result<WindowOutcome, RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn scan_keys(&self, _prefix: &str) -> Result<Vec<String>, RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        async fn prune(&self, _key: &str, _window_start_ms: i64) -> Result<u64, RateLimitError> {
            Err(RateLimitError::Storage("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn config(max_requests: u64, window: Duration) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window,
            ..Default::default()
        }
    }

    fn limiter(max_requests: u64, window: Duration) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(config(max_requests, window), Arc::new(MemoryStore::new()), noop())
    }

    #[tokio::test]
    async fn test_window_counts_down_then_recovers() {
        let limiter = limiter(5, Duration::from_secs(1));

        for expected in [4, 3, 2, 1, 0] {
            let result = limiter.check_rate_limit("ip:10.0.0.1").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert_eq!(result.limit, 5);
        }

        let denied = limiter.check_rate_limit("ip:10.0.0.1").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let again = limiter.check_rate_limit("ip:10.0.0.1").await.unwrap();
        assert!(again.allowed);
        assert_eq!(again.remaining, 4);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check_rate_limit("user:1").await.unwrap().allowed);
        assert!(!limiter.check_rate_limit("user:1").await.unwrap().allowed);
        assert!(limiter.check_rate_limit("user:2").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_status_does_not_count() {
        let limiter = limiter(3, Duration::from_secs(60));
        limiter.check_rate_limit("user:7").await.unwrap();

        for _ in 0..3 {
            let status = limiter.get_status("user:7").await.unwrap();
            assert_eq!(status.count, 1);
            assert_eq!(status.remaining, 2);
        }
    }

    #[tokio::test]
    async fn test_reset_clears_window() {
        let limiter = limiter(1, Duration::from_secs(60));
        limiter.check_rate_limit("user:7").await.unwrap();
        assert!(!limiter.check_rate_limit("user:7").await.unwrap().allowed);

        limiter.reset("user:7").await.unwrap();
        assert!(limiter.check_rate_limit("user:7").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_time_for_empty_window() {
        let limiter = limiter(3, Duration::from_secs(60));
        let before = Utc::now().timestamp();
        let status = limiter.get_status("ip:1.1.1.1").await.unwrap();
        assert!(status.reset_time >= before + 60);
        assert!(status.reset_time <= before + 62);
    }

    #[tokio::test]
    async fn test_fail_open_allows_with_full_quota() {
        let limiter = SlidingWindowRateLimiter::new(config(10, Duration::from_secs(60)), Arc::new(DownStore), noop());
        let result = limiter.check_rate_limit("ip:10.0.0.1").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 10);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let config = RateLimitConfig {
            failure_policy: FailurePolicy::Closed,
            ..config(10, Duration::from_secs(60))
        };
        let limiter = SlidingWindowRateLimiter::new(config, Arc::new(DownStore), noop());
        let err = limiter.check_rate_limit("ip:10.0.0.1").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitStoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_windows() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowRateLimiter::new(config(5, Duration::from_millis(50)), store.clone(), noop());
        limiter.check_rate_limit("ip:a").await.unwrap();
        limiter.check_rate_limit("ip:b").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        limiter.check_rate_limit("ip:b").await.unwrap();

        let report = limiter.cleanup_expired_entries().await.unwrap();
        assert_eq!(report.keys_scanned, 2);
        assert_eq!(report.keys_deleted, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let mut result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_time: 0,
            retry_after: Duration::from_millis(1200),
            limit: 5,
            window: Duration::from_secs(1),
        };
        assert_eq!(result.retry_after_secs(), 2);
        result.retry_after = Duration::ZERO;
        assert_eq!(result.retry_after_secs(), 1);
    }

    #[test]
    fn test_key_format() {
        let limiter = limiter(5, Duration::from_secs(1));
        assert_eq!(limiter.key("ip:10.0.0.1"), "rate_limit:ip:10.0.0.1");
    }
}
