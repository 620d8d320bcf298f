use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::admin::{AdminError, AdminResult, AdminState};
use crate::rate_limiting::RateLimitStatus;

pub fn routes() -> Router<AdminState> {
    Router::new().route(
        "/admin/ratelimit/:identifier",
        get(get_rate_limit_status).delete(reset_rate_limit),
    )
}

#[derive(Debug, Serialize)]
pub struct ResetRateLimitResponse {
    pub success: bool,
    pub identifier: String,
}

async fn get_rate_limit_status(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> AdminResult<RateLimitStatus> {
    let limiter = state.gateway.limiter().ok_or(AdminError::RateLimitingDisabled)?;
    Ok(Json(limiter.get_status(&identifier).await?))
}

async fn reset_rate_limit(
    State(state): State<AdminState>,
    Path(identifier): Path<String>,
) -> AdminResult<ResetRateLimitResponse> {
    let limiter = state.gateway.limiter().ok_or(AdminError::RateLimitingDisabled)?;
    limiter.reset(&identifier).await?;
    Ok(Json(ResetRateLimitResponse {
        success: true,
        identifier,
    }))
}
