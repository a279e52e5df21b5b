//! Internal hooks called by the identity provider

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisteredRequest {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisteredResponse {
    pub user_id: String,
    pub stripe_customer_id: String,
    pub created: bool,
}

/// Post-registration hook: Stripe customer, profile and free plan for a new user.
///
/// Safe to retry; an already registered user gets the existing customer back.
pub async fn user_registered(
    State(state): State<AppState>,
    Json(request): Json<UserRegisteredRequest>,
) -> Result<(StatusCode, Json<UserRegisteredResponse>), ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::Validation("userId is required".to_string()));
    }
    if !request.email.contains('@') {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let registration = billing
        .customer
        .register_user(
            &request.user_id,
            &request.email,
            request.display_name.as_deref().filter(|n| !n.is_empty()),
        )
        .await?;

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(UserRegisteredResponse {
            user_id: registration.profile.user_id,
            stripe_customer_id: registration.profile.stripe_customer_id,
            created: registration.created,
        }),
    ))
}
