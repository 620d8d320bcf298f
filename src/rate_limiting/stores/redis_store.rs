//! Redis-backed store for multi-node deployments.
//!
//! Windows are sorted sets scored by request time in milliseconds. The
//! sliding-window step and the cleanup prune are Lua scripts, so each one is
//! a single atomic command from Redis' point of view.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use tracing::info;

use super::{RateLimitError, RateLimitStore, WindowOutcome, WindowRequest};

const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local record = tonumber(ARGV[4])
local member = ARGV[5]
local ttl_ms = tonumber(ARGV[6])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local oldest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #first > 0 then
    oldest = tonumber(first[2])
end

if count >= limit then
    return {0, count, oldest}
end

if record == 1 then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, ttl_ms)
end
return {1, count, oldest}
";

const PRUNE_SCRIPT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local remaining = redis.call('ZCARD', KEYS[1])
if remaining == 0 then
    redis.call('DEL', KEYS[1])
end
return remaining
";

const SCAN_BATCH: usize = 100;

/// Shared store over a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    sliding_window: Script,
    prune: Script,
}

impl RedisStore {
    /// Open a managed connection to `redis_url`
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis rate-limit store");

        Ok(Self {
            connection,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            prune: Script::new(PRUNE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RateLimitError> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), RateLimitError> {
        let mut conn = self.conn();
        conn.pexpire::<_, ()>(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn sliding_window(&self, key: &str, request: &WindowRequest) -> Result<WindowOutcome, RateLimitError> {
        let mut conn = self.conn();
        let (allowed, count, oldest): (i64, i64, i64) = self
            .sliding_window
            .key(key)
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.max_requests)
            .arg(i64::from(request.record))
            .arg(&request.member)
            .arg(request.ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest_ms: (oldest >= 0).then_some(oldest),
        })
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, RateLimitError> {
        let mut conn = self.conn();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn prune(&self, key: &str, window_start_ms: i64) -> Result<u64, RateLimitError> {
        let mut conn = self.conn();
        let remaining: i64 = self.prune.key(key).arg(window_start_ms).invoke_async(&mut conn).await?;
        Ok(remaining.max(0) as u64)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
