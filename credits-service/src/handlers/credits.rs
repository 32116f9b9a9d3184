use crate::dtos::{
    parse_amount, ConsumeCreditRequest, ConsumeCreditResponse, CreditsResponse,
    InitializeCreditsResponse, SetPlanRequest, SetPlanResponse,
};
use crate::middleware::UserContext;
use crate::utils::ValidatedJson;
use crate::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

pub async fn initialize_credits(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<InitializeCreditsResponse>, AppError> {
    let outcome = state.ledger.initialize_credits(&user.uid).await?;

    Ok(Json(InitializeCreditsResponse {
        already_initialized: outcome.already_initialized,
        credits: outcome.ledger.credits,
        max_credits: outcome.ledger.max_credits,
        plan: outcome.ledger.plan,
    }))
}

pub async fn get_credits(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<CreditsResponse>, AppError> {
    let ledger = state.ledger.get_credits(&user.uid).await?;
    Ok(Json(CreditsResponse::from(&ledger)))
}

pub async fn consume_credit(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<ConsumeCreditRequest>,
) -> Result<Json<ConsumeCreditResponse>, AppError> {
    let amount = parse_amount(&req.amount)?;
    let remaining_credits = state.ledger.consume_credit(&user.uid, amount).await?;

    Ok(Json(ConsumeCreditResponse { remaining_credits }))
}

pub async fn set_plan(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<SetPlanRequest>,
) -> Result<Json<SetPlanResponse>, AppError> {
    let ledger = state.ledger.set_plan(&user.uid, &req.plan).await?;

    Ok(Json(SetPlanResponse {
        plan: ledger.plan,
        max_credits: ledger.max_credits,
    }))
}
