//! Gateway-wide status endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admin::AdminState;
use crate::core::circuit_breaker::CircuitState;
use crate::load_balancing::LoadBalancerStats;

pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(get_services))
        .route("/admin/health", get(get_health))
}

/// Derived availability of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Every backend healthy
    Healthy,
    /// Some backends healthy
    Degraded,
    /// No healthy backend
    Unhealthy,
}

impl ServiceStatus {
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if healthy == 0 {
            ServiceStatus::Unhealthy
        } else if healthy < total {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub service: String,
    pub path_prefix: String,
    pub status: ServiceStatus,
    pub healthy_backends: usize,
    pub total_backends: usize,
    pub circuit_state: Option<CircuitState>,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatusResponse {
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
    pub services: Vec<ServiceSummary>,
}

#[derive(Debug, Serialize)]
pub struct ServicesResponse {
    pub services: Vec<LoadBalancerStats>,
    pub total_count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub unavailable_services: Vec<String>,
}

fn summaries(state: &AdminState) -> Vec<ServiceSummary> {
    let breakers = state.gateway.breakers();
    state
        .gateway
        .services()
        .map(|route| {
            let healthy = route.pool.get_healthy_backends().len();
            let total = route.pool.get_total_backends();
            ServiceSummary {
                service: route.name.clone(),
                path_prefix: route.path_prefix.clone(),
                status: ServiceStatus::from_counts(healthy, total),
                healthy_backends: healthy,
                total_backends: total,
                circuit_state: breakers.get_state(&route.name).ok(),
            }
        })
        .collect()
}

async fn get_status(State(state): State<AdminState>) -> Json<GatewayStatusResponse> {
    let services = summaries(&state);
    let available = services.iter().filter(|s| s.status != ServiceStatus::Unhealthy).count();
    let all_healthy = services.iter().all(|s| s.status == ServiceStatus::Healthy);

    let status = if all_healthy {
        ServiceStatus::Healthy
    } else if available == 0 {
        ServiceStatus::Unhealthy
    } else {
        ServiceStatus::Degraded
    };

    Json(GatewayStatusResponse {
        status,
        timestamp: Utc::now(),
        services,
    })
}

async fn get_services(State(state): State<AdminState>) -> Json<ServicesResponse> {
    let services: Vec<LoadBalancerStats> = state.gateway.services().map(|route| route.pool.get_stats()).collect();
    Json(ServicesResponse {
        total_count: services.len(),
        services,
    })
}

async fn get_health(State(state): State<AdminState>) -> Response {
    let unavailable: Vec<String> = summaries(&state)
        .into_iter()
        .filter(|s| s.status == ServiceStatus::Unhealthy)
        .map(|s| s.service)
        .collect();

    let healthy = unavailable.is_empty();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            unavailable_services: unavailable,
        }),
    )
        .into_response()
}
