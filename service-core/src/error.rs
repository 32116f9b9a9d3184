use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Business precondition failure; `details.reason` tells clients which one.
    #[error("Failed precondition: {message}")]
    FailedPrecondition {
        message: String,
        details: Option<Value>,
    },

    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        retry_after: Option<u64>,
        details: Option<Value>,
    },

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable error code included in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) | AppError::InvalidArgument(_) => "invalid_argument",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::FailedPrecondition { .. } => "failed_precondition",
            AppError::ResourceExhausted { .. } => "resource_exhausted",
            AppError::BadGateway(_)
            | AppError::ServiceUnavailable
            | AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::FailedPrecondition { .. } => StatusCode::PRECONDITION_FAILED,
            AppError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, details, retry_after) = match self {
            AppError::ValidationError(err) => (
                "Validation error".to_string(),
                Some(Value::String(err.to_string())),
                None,
            ),
            AppError::InvalidArgument(msg)
            | AppError::Unauthenticated(msg)
            | AppError::NotFound(msg)
            | AppError::AlreadyExists(msg) => (msg, None, None),
            AppError::FailedPrecondition { message, details } => (message, details, None),
            AppError::ResourceExhausted {
                message,
                retry_after,
                details,
            } => (message, details, retry_after),
            AppError::BadGateway(msg) => {
                tracing::warn!(error = %msg, "Upstream failure");
                ("Upstream service error".to_string(), None, None)
            }
            AppError::ServiceUnavailable => ("Service unavailable".to_string(), None, None),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                ("Internal server error".to_string(), None, None)
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                ("Database error".to_string(), None, None)
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Configuration error".to_string(), None, None)
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                code,
                message,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
