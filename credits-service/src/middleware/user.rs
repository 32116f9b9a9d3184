//! Caller identity.
//!
//! The gateway in front of this service authenticates the end user and
//! forwards the verified uid in `X-User-ID`.

use axum::{extract::FromRequestParts, http::request::Parts};
use service_core::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct UserContext {
    pub uid: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uid = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Unauthenticated("missing caller identity".to_string()))?;

        tracing::Span::current().record("uid", uid);

        Ok(UserContext {
            uid: uid.to_string(),
        })
    }
}
