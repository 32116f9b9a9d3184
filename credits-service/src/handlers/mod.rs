pub mod credits;
pub mod generations;
pub mod internal;
pub mod purchases;

use crate::services::get_metrics;
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

/// Liveness plus a store ping.
pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state.repository.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": state.service_name,
            "version": env!("CARGO_PKG_VERSION")
        })),
    ))
}

pub async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}
