//! Request authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use super::jwt::JwtError;
use crate::{error::ApiError, state::AppState};

/// Header carrying the shared secret on internal hooks
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// Authenticated user, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

/// Require a valid bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.validate_token(token).map_err(|e| {
        match &e {
            JwtError::Expired => tracing::debug!("Expired access token"),
            _ => tracing::warn!(error = %e, "Rejected access token"),
        }
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
    });

    Ok(next.run(request).await)
}

/// Require the internal hook token (constant-time compare)
pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let expected = state.config.internal_api_token.as_bytes();
    if !bool::from(provided.as_bytes().ct_eq(expected)) {
        tracing::warn!("Internal hook called with a wrong token");
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}
