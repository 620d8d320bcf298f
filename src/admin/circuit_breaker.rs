//! Circuit Breaker Admin Endpoints
//!
//! Reset forces a breaker back to Closed with fresh counts, which lets
//! traffic hit a service that is still failing. Use with care.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use crate::admin::{AdminResult, AdminState};
use crate::core::circuit_breaker::{CircuitBreakerStats, CircuitState};

pub fn routes() -> Router<AdminState> {
    Router::new()
        .route("/admin/circuitbreaker", get(list_circuit_breakers))
        .route("/admin/circuitbreaker/:service", get(get_circuit_breaker))
        .route("/admin/circuitbreaker/:service/reset", post(reset_circuit_breaker))
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub total_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: String,
    pub new_state: CircuitState,
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> Json<CircuitBreakerListResponse> {
    let circuit_breakers = state.gateway.breakers().list();
    Json(CircuitBreakerListResponse {
        total_count: circuit_breakers.len(),
        circuit_breakers,
    })
}

async fn get_circuit_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> AdminResult<CircuitBreakerStats> {
    Ok(Json(state.gateway.breakers().get_stats(&service)?))
}

async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> AdminResult<ResetResponse> {
    let breakers = state.gateway.breakers();
    breakers.reset(&service)?;
    info!(breaker = %service, "Circuit breaker reset via admin API");

    Ok(Json(ResetResponse {
        success: true,
        message: format!("Circuit breaker for {} reset", service),
        new_state: breakers.get_state(&service)?,
    }))
}
