//! In-process store backed by `DashMap`.
//!
//! Each sliding-window step runs while holding the shard lock of its key
//! (`DashMap::entry` / `get_mut`), so concurrent checks against one key are
//! serialized exactly like the Redis script.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{RateLimitError, RateLimitStore, WindowOutcome, WindowRequest};

/// A key holds either a plain value or a window of (score, member) pairs
#[derive(Debug, Default)]
struct Slot {
    text: Option<String>,
    /// Sorted by score
    window: Vec<(i64, String)>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Window entries, clearing an expired slot or a plain value first
    fn window_mut(&mut self, now: Instant) -> &mut Vec<(i64, String)> {
        if self.is_expired(now) || self.text.is_some() {
            *self = Slot::default();
        }
        &mut self.window
    }
}

/// Single-node rate-limit store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune_window(entries: &mut Vec<(i64, String)>, window_start_ms: i64) {
    let keep_from = entries.partition_point(|(score, _)| *score <= window_start_ms);
    entries.drain(..keep_from);
}

fn outcome(entries: &[(i64, String)], max_requests: u64) -> WindowOutcome {
    let count = entries.len() as u64;
    WindowOutcome {
        allowed: count < max_requests,
        count,
        oldest_ms: entries.first().map(|(score, _)| *score),
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RateLimitError> {
        let now = Instant::now();
        let value = match self.data.get(key) {
            Some(slot) if !slot.is_expired(now) => match &slot.text {
                Some(text) => Some(text.clone()),
                None => {
                    return Err(RateLimitError::Storage(format!("key '{}' holds a window, not a value", key)));
                }
            },
            _ => None,
        };
        if value.is_none() {
            self.data.remove_if(key, |_, slot| slot.is_expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RateLimitError> {
        self.data.insert(
            key.to_string(),
            Slot {
                text: Some(value.to_string()),
                window: Vec::new(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        self.data.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), RateLimitError> {
        if let Some(mut slot) = self.data.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn sliding_window(&self, key: &str, request: &WindowRequest) -> Result<WindowOutcome, RateLimitError> {
        let now = Instant::now();
        let window_start = request.now_ms - request.window_ms;

        if !request.record {
            let Some(mut slot) = self.data.get_mut(key) else {
                return Ok(outcome(&[], request.max_requests));
            };
            let entries = slot.window_mut(now);
            prune_window(entries, window_start);
            return Ok(outcome(entries, request.max_requests));
        }

        let mut slot = self.data.entry(key.to_string()).or_default();
        let entries = slot.window_mut(now);
        prune_window(entries, window_start);

        let result = outcome(entries, request.max_requests);
        if result.allowed {
            let at = entries.partition_point(|(score, _)| *score <= request.now_ms);
            entries.insert(at, (request.now_ms, request.member.clone()));
            slot.expires_at = Some(now + request.ttl);
        }
        Ok(result)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, RateLimitError> {
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn prune(&self, key: &str, window_start_ms: i64) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let mut remaining = 0u64;

        let removed = self.data.remove_if_mut(key, |_, slot| {
            if slot.is_expired(now) {
                return true;
            }
            if slot.text.is_some() {
                remaining = 1;
                return false;
            }
            prune_window(&mut slot.window, window_start_ms);
            remaining = slot.window.len() as u64;
            slot.window.is_empty()
        });

        if removed.is_some() {
            remaining = 0;
        }
        Ok(remaining)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
