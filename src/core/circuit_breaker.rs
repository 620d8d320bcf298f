//! Circuit Breaker Implementation
//!
//! One breaker per upstream service, each a failure-ratio state machine:
//!
//! - **Closed**: calls pass through and outcomes are counted. Once enough
//!   calls have been seen (`min_requests`) and the failure ratio reaches
//!   `failure_ratio`, the breaker opens.
//! - **Open**: calls fail fast with `CircuitOpen` until `timeout` elapses.
//! - **HalfOpen**: up to `max_requests` probe calls are let through. Enough
//!   consecutive successes close the breaker; any failure re-opens it.
//!
//! Counts belong to a *generation*. A new generation starts on every state
//! change and, while Closed, every `interval`. Outcomes of calls that started
//! in an older generation are dropped.
//!
//! The breaker's mutex is never held across an `.await`: a call is split into
//! `before_request` and `after_request` around the guarded future.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics::GatewayMetrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for gauges: closed 0, half-open 1, open 2
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether the gateway guards the service with a breaker at all
    pub enabled: bool,

    /// Maximum probe requests allowed while HalfOpen
    pub max_requests: u32,

    /// Length of a Closed-state counting interval; zero never clears counts
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long the breaker stays Open before probing
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Minimum requests in a generation before the breaker may trip
    pub min_requests: u32,

    /// Failure ratio (0.0-1.0) at or above which the breaker trips
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

/// Request counts for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }

    /// Failures over requests, 0.0 when no requests were seen
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.requests as f64
    }
}

/// Read-only snapshot for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub counts: Counts,
    pub failure_ratio: f64,
    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A single named circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<dyn GatewayMetrics>,
}

impl CircuitBreaker {
    /// Create a breaker in the Closed state
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, metrics: Arc<dyn GatewayMetrics>) -> Self {
        let now = Instant::now();
        let expiry = closed_expiry(&config, now);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying any time-based transition that is due
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now())
    }

    /// Counts of the current generation
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, Instant::now());
        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            counts: inner.counts,
            failure_ratio: inner.counts.failure_ratio(),
            config: self.config.clone(),
        }
    }

    /// Run `f` through the breaker; an `Err` counts as a failure
    pub async fn call<F, Fut, T>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.call_classified(f, |result| result.is_ok()).await
    }

    /// Run `f` through the breaker with a caller-supplied success predicate.
    ///
    /// The result is returned unchanged either way. If the future is dropped
    /// before it completes, the call is recorded as a failure.
    pub async fn call_classified<F, Fut, T, C>(&self, f: F, is_success: C) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
        C: FnOnce(&GatewayResult<T>) -> bool,
    {
        let generation = self.before_request()?;
        let mut in_flight = InFlight {
            breaker: self,
            generation,
            finished: false,
        };

        let result = f().await;

        in_flight.finished = true;
        self.after_request(generation, is_success(&result));
        result
    }

    fn before_request(&self) -> GatewayResult<u64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);

        let rejected = match state {
            CircuitState::Open => true,
            CircuitState::HalfOpen => inner.counts.requests >= self.config.max_requests,
            CircuitState::Closed => false,
        };
        if rejected {
            return Err(GatewayError::CircuitOpen {
                service: self.name.clone(),
            });
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);
        if inner.generation != before {
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    fn on_success(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_requests {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    warn!(
                        breaker = %self.name,
                        requests = inner.counts.requests,
                        failures = inner.counts.total_failures,
                        failure_ratio = inner.counts.failure_ratio(),
                        "Circuit breaker tripped"
                    );
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Half-open probe failed, re-opening circuit");
                self.set_state(inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.config.min_requests && counts.failure_ratio() >= self.config.failure_ratio
    }

    fn current_state(&self, inner: &mut BreakerInner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);

        info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        self.metrics.record_circuit_state_change(&self.name, from, to);
    }

    fn new_generation(&self, inner: &mut BreakerInner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed => closed_expiry(&self.config, now),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

fn closed_expiry(config: &CircuitBreakerConfig, now: Instant) -> Option<Instant> {
    if config.interval.is_zero() {
        None
    } else {
        Some(now + config.interval)
    }
}

/// Records a failure if the guarded future is dropped mid-flight
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.after_request(self.generation, false);
        }
    }
}

/// Registry of per-service breakers
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Arc<dyn GatewayMetrics>,
}

impl CircuitBreakerManager {
    pub fn new(metrics: Arc<dyn GatewayMetrics>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Create (or replace and reset) the breaker for `name`
    pub fn create_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config, self.metrics.clone()));
        self.breakers.write().insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> GatewayResult<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::breaker_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.breakers.read().contains_key(name)
    }

    /// Run `f` through the named breaker
    pub async fn execute<F, Fut, T>(&self, name: &str, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let breaker = self.get(name)?;
        breaker.call(f).await
    }

    /// Run `f` through the named breaker with a custom success predicate
    pub async fn execute_classified<F, Fut, T, C>(&self, name: &str, f: F, is_success: C) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
        C: FnOnce(&GatewayResult<T>) -> bool,
    {
        let breaker = self.get(name)?;
        breaker.call_classified(f, is_success).await
    }

    pub fn get_state(&self, name: &str) -> GatewayResult<CircuitState> {
        Ok(self.get(name)?.state())
    }

    pub fn get_stats(&self, name: &str) -> GatewayResult<CircuitBreakerStats> {
        Ok(self.get(name)?.stats())
    }

    /// Discard the breaker's state, recreating it Closed with the same config
    pub fn reset(&self, name: &str) -> GatewayResult<()> {
        let config = self.get(name)?.config().clone();
        self.create_breaker(name, config);
        info!(breaker = %name, "Circuit breaker reset");
        Ok(())
    }

    /// Snapshot of every breaker, sorted by name
    pub fn list(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut stats: Vec<CircuitBreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
