//! Request and response bodies. All camelCase on the wire.

use crate::models::{Plan, UserLedger};
use crate::services::ledger::{MAX_CONSUME_AMOUNT, MIN_CONSUME_AMOUNT};
use crate::services::CreditError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Read a credit amount. It must be an integral JSON number within
/// the allowed range; `2.0` is accepted, `2.5` and `"2"` are not.
pub fn parse_amount(value: &Value) -> Result<i64, CreditError> {
    let out_of_range = || {
        CreditError::InvalidArgument(format!(
            "amount must be an integer between {} and {}",
            MIN_CONSUME_AMOUNT, MAX_CONSUME_AMOUNT
        ))
    };

    let amount = match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => f as i64,
            _ => return Err(out_of_range()),
        },
        _ => return Err(out_of_range()),
    };

    if (MIN_CONSUME_AMOUNT..=MAX_CONSUME_AMOUNT).contains(&amount) {
        Ok(amount)
    } else {
        Err(out_of_range())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeCreditsResponse {
    pub already_initialized: bool,
    pub credits: i64,
    pub max_credits: i64,
    pub plan: Plan,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub credits: i64,
    pub max_credits: i64,
    pub plan: Plan,
}

impl From<&UserLedger> for CreditsResponse {
    fn from(ledger: &UserLedger) -> Self {
        Self {
            credits: ledger.credits,
            max_credits: ledger.max_credits,
            plan: ledger.plan,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConsumeCreditRequest {
    pub amount: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeCreditResponse {
    pub remaining_credits: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SetPlanRequest {
    #[validate(length(min = 1, message = "plan is required"))]
    pub plan: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPlanResponse {
    pub plan: Plan,
    pub max_credits: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TopUpRequest {
    #[validate(length(min = 1, message = "productId is required"))]
    pub product_id: String,
    #[validate(length(min = 1, max = 256, message = "transactionId is required"))]
    pub transaction_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUpResponse {
    pub credits_added: i64,
    pub new_balance: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    #[validate(length(min = 1, message = "productId is required"))]
    pub product_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPurchaseResponse {
    pub plan: Plan,
    pub credits_granted: i64,
    pub expires_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRestoreResponse {
    pub plan: Plan,
    pub expires_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequestDto {
    #[validate(length(min = 1, max = 4000, message = "prompt must be 1-4000 characters"))]
    pub prompt: String,
    #[serde(default)]
    pub input_image_base64: Option<String>,
    /// Defaults to one credit.
    #[serde(default)]
    pub credits: Option<Value>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingGenerationRequest {
    #[validate(length(min = 1, max = 4000, message = "prompt must be 1-4000 characters"))]
    pub prompt: String,
    #[serde(default)]
    pub input_image_base64: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub mime_type: String,
    pub image_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_credits: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IdentityCreatedRequest {
    #[validate(length(min = 1, message = "uid is required"))]
    pub uid: String,
}
