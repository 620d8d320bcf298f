//! Load Balancer Admin Endpoints
//!
//! Pool inspection plus runtime backend changes: add, remove, and manual
//! health overrides. Health overrides last until the next active probe.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::admin::{AdminResult, AdminState};
use crate::load_balancing::{BackendStats, LoadBalancerStats};

pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/loadbalancer/:service", get(get_load_balancer_stats))
        .route(
            "/admin/loadbalancer/:service/backends",
            post(add_backend).delete(remove_backend),
        )
        .route("/admin/loadbalancer/:service/backends/health", put(set_backend_health))
}

#[derive(Debug, Deserialize)]
pub struct AddBackendRequest {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RemoveBackendRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct SetHealthRequest {
    pub url: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct BackendChangeResponse {
    pub success: bool,
    pub message: String,
}

async fn get_load_balancer_stats(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> AdminResult<LoadBalancerStats> {
    let pool = state.gateway.pool(&service)?;
    Ok(Json(pool.get_stats()))
}

async fn add_backend(
    State(state): State<AdminState>,
    Path(service): Path<String>,
    Json(request): Json<AddBackendRequest>,
) -> Result<(StatusCode, Json<BackendStats>), crate::admin::AdminError> {
    let pool = state.gateway.pool(&service)?;
    let backend = pool.add_backend(&request.url, request.weight)?;
    info!(service = %service, backend = %request.url, "Backend added via admin API");
    Ok((StatusCode::CREATED, Json(backend.stats())))
}

async fn remove_backend(
    State(state): State<AdminState>,
    Path(service): Path<String>,
    Json(request): Json<RemoveBackendRequest>,
) -> AdminResult<BackendChangeResponse> {
    let pool = state.gateway.pool(&service)?;
    pool.remove_backend(&request.url)?;
    info!(service = %service, backend = %request.url, "Backend removed via admin API");
    Ok(Json(BackendChangeResponse {
        success: true,
        message: format!("Backend {} removed from {}", request.url, service),
    }))
}

async fn set_backend_health(
    State(state): State<AdminState>,
    Path(service): Path<String>,
    Json(request): Json<SetHealthRequest>,
) -> AdminResult<BackendChangeResponse> {
    let pool = state.gateway.pool(&service)?;
    pool.set_backend_health(&request.url, request.healthy)?;
    info!(
        service = %service,
        backend = %request.url,
        healthy = request.healthy,
        "Backend health overridden via admin API"
    );
    Ok(Json(BackendChangeResponse {
        success: true,
        message: format!(
            "Backend {} marked {}",
            request.url,
            if request.healthy { "healthy" } else { "unhealthy" }
        ),
    }))
}
