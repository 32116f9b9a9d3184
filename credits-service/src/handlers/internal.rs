//! Admin-only endpoints: identity hook, backfill and manual job runs.

use crate::dtos::IdentityCreatedRequest;
use crate::middleware::AdminContext;
use crate::services::bootstrap::BackfillReport;
use crate::services::monthly_grants::GrantReport;
use crate::services::reconciler::ReconcileReport;
use crate::utils::ValidatedJson;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

/// Identity-created hook. Always accepted; bootstrap failures are logged
/// and never reach the identity provider.
pub async fn identity_created(
    State(state): State<AppState>,
    _admin: AdminContext,
    ValidatedJson(req): ValidatedJson<IdentityCreatedRequest>,
) -> StatusCode {
    state.bootstrap.on_identity_created(&req.uid).await;
    StatusCode::ACCEPTED
}

pub async fn backfill(
    State(state): State<AppState>,
    _admin: AdminContext,
) -> Result<Json<BackfillReport>, AppError> {
    let report = state.bootstrap.backfill_all().await?;
    Ok(Json(report))
}

pub async fn run_monthly_grants(
    State(state): State<AppState>,
    _admin: AdminContext,
) -> Result<Json<GrantReport>, AppError> {
    let report = state.scheduler.run_monthly_grants().await?;
    Ok(Json(report))
}

pub async fn run_reconciliation(
    State(state): State<AppState>,
    _admin: AdminContext,
) -> Result<Json<ReconcileReport>, AppError> {
    let report = state.scheduler.run_reconciliation().await?;
    Ok(Json(report))
}
