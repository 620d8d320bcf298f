//! # Admin API
//!
//! JSON endpoints for operators, served on the admin listener only.
//!
//! ## Security Note
//! None of these routes authenticate. Bind the admin listener to a private
//! interface.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;

use crate::core::error::GatewayError;
use crate::gateway::Gateway;

pub mod circuit_breaker;
pub mod endpoints;
pub mod load_balancer;
pub mod rate_limiting;

/// Shared state for every admin handler
#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

/// Every admin route
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .merge(endpoints::routes())
        .merge(load_balancer::routes())
        .merge(circuit_breaker::routes())
        .merge(rate_limiting::routes())
        .with_state(state)
}

/// Error body returned by admin handlers
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Admin handler failure
#[derive(Debug)]
pub enum AdminError {
    Gateway(GatewayError),
    RateLimitingDisabled,
}

impl From<GatewayError> for AdminError {
    fn from(err: GatewayError) -> Self {
        AdminError::Gateway(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AdminError::Gateway(err) => (
                err.status_code(),
                ErrorResponse {
                    error: err.error_type().to_string(),
                    message: err.to_string(),
                },
            ),
            AdminError::RateLimitingDisabled => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: "rate_limiting_disabled".to_string(),
                    message: "Rate limiting is not enabled".to_string(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type AdminResult<T> = Result<Json<T>, AdminError>;
