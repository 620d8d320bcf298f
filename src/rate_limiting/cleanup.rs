//! Scheduled sweep of idle rate-limit windows.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rate_limiting::limiter::SlidingWindowRateLimiter;

/// Runs `cleanup_expired_entries` every `interval` until cancelled
pub struct RateLimitCleanupTask;

impl RateLimitCleanupTask {
    pub fn spawn(
        limiter: Arc<SlidingWindowRateLimiter>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // First sweep one full interval after start.
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(interval = ?interval, "Rate limit cleanup task started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = limiter.cleanup_expired_entries().await {
                            warn!(error = %e, "Rate limit cleanup failed");
                        }
                    }
                }
            }
            info!("Rate limit cleanup task stopped");
        })
    }
}
