use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::db::User;
use crate::error::AppError;
use crate::services::auth::AuthService;
use crate::AppState;

/// Extractor for the authenticated caller (`Authorization: Bearer <jwt>`).
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        let token = match auth_header.get(..7) {
            Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => auth_header[7..].trim(),
            _ => {
                tracing::debug!("Authorization header doesn't start with 'Bearer '");
                return Err(AppError::Unauthorized);
            }
        };
        if token.is_empty() {
            tracing::debug!("Empty bearer token in Authorization header");
            return Err(AppError::Unauthorized);
        }

        let user = AuthService::get_user_from_token(&state.db, &state.config.jwt.secret, token)
            .await
            .map_err(|e| {
                tracing::debug!("Failed to get user from token: {:?}", e);
                e
            })?;

        tracing::debug!("Authenticated user: {}", user.id);
        Ok(AuthUser(user))
    }
}
