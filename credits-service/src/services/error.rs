use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Cooldown,
    ConcurrentLimit,
    InsufficientCredits,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::Cooldown => "cooldown",
            RateLimitReason::ConcurrentLimit => "concurrent_limit",
            RateLimitReason::InsufficientCredits => "insufficient_credits",
        }
    }
}

#[derive(Error, Debug)]
pub enum CreditError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Ledger not found for user")]
    NotFound,

    #[error("Rate limited: {}", reason.as_str())]
    RateLimited {
        reason: RateLimitReason,
        retry_after_seconds: Option<u64>,
        current_credits: Option<i64>,
    },

    #[error("Insufficient credits: {current_credits} available, {required} required")]
    InsufficientCredits { current_credits: i64, required: i64 },

    #[error("Transaction already processed")]
    AlreadyProcessed,

    #[error("Purchase could not be verified")]
    VerificationFailed,

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("Subscription expired")]
    SubscriptionExpired,

    #[error("Free onboarding generation already used")]
    OnboardingGenerationUsed,

    #[error("Billing oracle error: {0}")]
    Oracle(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Store error: {0}")]
    Store(#[from] mongodb::error::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CreditError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            CreditError::Unauthenticated(_) => "unauthenticated",
            CreditError::InvalidArgument(_) => "invalid_argument",
            CreditError::NotFound => "not_found",
            CreditError::RateLimited { .. } | CreditError::InsufficientCredits { .. } => {
                "resource_exhausted"
            }
            CreditError::AlreadyProcessed => "already_exists",
            CreditError::VerificationFailed
            | CreditError::NoActiveSubscription
            | CreditError::SubscriptionExpired
            | CreditError::OnboardingGenerationUsed => "failed_precondition",
            CreditError::Oracle(_)
            | CreditError::Generation(_)
            | CreditError::Store(_)
            | CreditError::Internal(_) => "internal",
        }
    }

    fn precondition_reason(&self) -> &'static str {
        match self {
            CreditError::VerificationFailed => "verification_failed",
            CreditError::NoActiveSubscription => "no_active_subscription",
            CreditError::SubscriptionExpired => "subscription_expired",
            CreditError::OnboardingGenerationUsed => "onboarding_generation_used",
            _ => "unknown",
        }
    }
}

impl From<CreditError> for AppError {
    fn from(err: CreditError) -> Self {
        match err {
            CreditError::Unauthenticated(msg) => AppError::Unauthenticated(msg),
            CreditError::InvalidArgument(msg) => AppError::InvalidArgument(msg),
            CreditError::NotFound => AppError::NotFound("Ledger not found for user".to_string()),
            CreditError::RateLimited {
                reason,
                retry_after_seconds,
                current_credits,
            } => {
                let mut details = json!({ "reason": reason.as_str() });
                if let Some(retry) = retry_after_seconds {
                    details["retryAfterSeconds"] = json!(retry);
                }
                if let Some(credits) = current_credits {
                    details["currentCredits"] = json!(credits);
                }
                AppError::ResourceExhausted {
                    message: format!("Rate limited: {}", reason.as_str()),
                    retry_after: retry_after_seconds,
                    details: Some(details),
                }
            }
            CreditError::InsufficientCredits {
                current_credits,
                required,
            } => AppError::ResourceExhausted {
                message: "Insufficient credits".to_string(),
                retry_after: None,
                details: Some(json!({
                    "reason": RateLimitReason::InsufficientCredits.as_str(),
                    "currentCredits": current_credits,
                    "required": required,
                })),
            },
            CreditError::AlreadyProcessed => {
                AppError::AlreadyExists("Transaction already processed".to_string())
            }
            e @ (CreditError::VerificationFailed
            | CreditError::NoActiveSubscription
            | CreditError::SubscriptionExpired
            | CreditError::OnboardingGenerationUsed) => AppError::FailedPrecondition {
                message: e.to_string(),
                details: Some(json!({ "reason": e.precondition_reason() })),
            },
            CreditError::Oracle(msg) => AppError::BadGateway(msg),
            CreditError::Generation(msg) => {
                AppError::InternalError(anyhow::anyhow!("Generation failed: {}", msg))
            }
            CreditError::Store(e) => AppError::DatabaseError(e.into()),
            CreditError::Internal(e) => AppError::InternalError(e),
        }
    }
}
