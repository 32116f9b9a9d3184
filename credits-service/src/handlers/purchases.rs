use crate::dtos::{
    SubscriptionPurchaseResponse, SubscriptionRequest, SubscriptionRestoreResponse, TopUpRequest,
    TopUpResponse,
};
use crate::middleware::UserContext;
use crate::services::SubscriptionEvent;
use crate::utils::ValidatedJson;
use crate::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

pub async fn purchase_topup(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<TopUpRequest>,
) -> Result<Json<TopUpResponse>, AppError> {
    let outcome = state
        .purchases
        .validate_and_grant(&user.uid, &req.product_id, &req.transaction_id)
        .await?;

    Ok(Json(TopUpResponse {
        credits_added: outcome.credits_added,
        new_balance: outcome.new_balance,
    }))
}

pub async fn purchase_subscription(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<SubscriptionRequest>,
) -> Result<Json<SubscriptionPurchaseResponse>, AppError> {
    let outcome = state
        .purchases
        .validate_subscription(&user.uid, &req.product_id, SubscriptionEvent::Purchase)
        .await?;

    Ok(Json(SubscriptionPurchaseResponse {
        plan: outcome.plan,
        credits_granted: outcome.credits_granted,
        expires_date: outcome.expires_date,
    }))
}

pub async fn restore_subscription(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<SubscriptionRequest>,
) -> Result<Json<SubscriptionRestoreResponse>, AppError> {
    let outcome = state
        .purchases
        .validate_subscription(&user.uid, &req.product_id, SubscriptionEvent::Restore)
        .await?;

    Ok(Json(SubscriptionRestoreResponse {
        plan: outcome.plan,
        expires_date: outcome.expires_date,
    }))
}
