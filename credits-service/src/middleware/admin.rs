use crate::AppState;
use axum::{extract::FromRequestParts, http::request::Parts};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Marker for requests carrying the admin API key.
#[derive(Debug, Clone, Copy)]
pub struct AdminContext;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let expected = state.admin_api_key.expose_secret();
        let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();

        if expected.is_empty() || !matches {
            tracing::warn!("Failed admin authentication attempt");
            return Err(AppError::Unauthenticated(
                "invalid or missing admin key".to_string(),
            ));
        }

        Ok(AdminContext)
    }
}
