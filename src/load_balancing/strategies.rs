use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::error::GatewayError;
use crate::load_balancing::backend::Backend;

/// Backend selection algorithm, fixed per pool at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
}

impl BalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancingStrategy::RoundRobin => "round_robin",
            BalancingStrategy::LeastConnections => "least_connections",
            BalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
            BalancingStrategy::Random => "random",
        }
    }

    /// Pick one of `healthy`, which must be non-empty
    pub(crate) fn select(&self, healthy: &[Arc<Backend>], cursor: &AtomicU64) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }

        let index = match self {
            BalancingStrategy::RoundRobin => round_robin(healthy.len(), cursor),
            BalancingStrategy::LeastConnections => least_connections(healthy),
            BalancingStrategy::WeightedRoundRobin => weighted_round_robin(healthy, cursor),
            BalancingStrategy::Random => rand::thread_rng().gen_range(0..healthy.len()),
        };
        healthy.get(index).cloned()
    }
}

impl fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BalancingStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(BalancingStrategy::RoundRobin),
            "least_connections" => Ok(BalancingStrategy::LeastConnections),
            "weighted_round_robin" => Ok(BalancingStrategy::WeightedRoundRobin),
            "random" => Ok(BalancingStrategy::Random),
            other => Err(GatewayError::config(format!("Unknown load balancing strategy: {}", other))),
        }
    }
}

fn round_robin(len: usize, cursor: &AtomicU64) -> usize {
    (cursor.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
}

// First minimum wins.
fn least_connections(healthy: &[Arc<Backend>]) -> usize {
    let mut best = 0;
    let mut best_active = u64::MAX;
    for (index, backend) in healthy.iter().enumerate() {
        let active = backend.active_connections();
        if active < best_active {
            best = index;
            best_active = active;
        }
    }
    best
}

// Plain modulo over cumulative weights, no smoothing: consecutive picks land
// on the same backend for `weight` turns.
fn weighted_round_robin(healthy: &[Arc<Backend>], cursor: &AtomicU64) -> usize {
    let total: u64 = healthy.iter().map(|b| u64::from(b.weight())).sum();
    if total == 0 {
        return round_robin(healthy.len(), cursor);
    }

    let point = cursor.fetch_add(1, Ordering::Relaxed) % total;
    let mut cumulative = 0u64;
    for (index, backend) in healthy.iter().enumerate() {
        cumulative += u64::from(backend.weight());
        if point < cumulative {
            return index;
        }
    }
    healthy.len() - 1
}
