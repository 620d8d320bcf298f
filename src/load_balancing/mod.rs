pub mod backend;
pub mod balancer;
pub mod health;
pub mod strategies;

pub use backend::{Backend, BackendStats, ConnectionGuard};
pub use balancer::{LoadBalancer, LoadBalancerStats};
pub use health::{HealthChecker, ProbeOutcome};
pub use strategies::BalancingStrategy;
