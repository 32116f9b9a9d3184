use crate::dtos::{
    parse_amount, GenerationRequestDto, GenerationResponse, OnboardingGenerationRequest,
};
use crate::middleware::UserContext;
use crate::services::generator::GenerationRequest;
use crate::utils::ValidatedJson;
use crate::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

/// Metered generation. The work runs on its own task, so a client that
/// disconnects mid-generation still gets its slot released.
pub async fn run_metered_generation(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<GenerationRequestDto>,
) -> Result<Json<GenerationResponse>, AppError> {
    let credits = match &req.credits {
        Some(value) => parse_amount(value)?,
        None => 1,
    };
    let request = GenerationRequest {
        prompt: req.prompt,
        input_image_base64: req.input_image_base64,
    };

    let metered = state
        .generation
        .run_metered_detached(user.uid, request, credits)
        .await?;

    Ok(Json(GenerationResponse {
        mime_type: metered.value.mime_type,
        image_base64: metered.value.image_base64,
        remaining_credits: metered.remaining_credits,
    }))
}

pub async fn run_onboarding_generation(
    State(state): State<AppState>,
    user: UserContext,
    ValidatedJson(req): ValidatedJson<OnboardingGenerationRequest>,
) -> Result<Json<GenerationResponse>, AppError> {
    let request = GenerationRequest {
        prompt: req.prompt,
        input_image_base64: req.input_image_base64,
    };

    let image = state.generation.run_onboarding(&user.uid, request).await?;

    Ok(Json(GenerationResponse {
        mime_type: image.mime_type,
        image_base64: image.image_base64,
        remaining_credits: None,
    }))
}
