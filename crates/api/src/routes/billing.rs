//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use saaskit_billing::{
    parse_event, verify_signature, webhooks::unix_now, BillingService, CurrentPlan, PlanCatalog,
    PortalResponse, ReconcileOutcome, WebhookOutcome,
};
use saaskit_shared::Plan;
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to create a portal session
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub current: CurrentPlan,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

fn billing(state: &AppState) -> Result<&BillingService, ApiError> {
    state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)
}

/// List active plans in catalog order
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<PlansResponse>, ApiError> {
    let plans = PlanCatalog::new(state.store.clone())
        .list_active_plans()
        .await?;
    Ok(Json(PlansResponse { plans }))
}

/// Get the current user's subscription and effective plan
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<CurrentPlan>, ApiError> {
    let current = billing(&state)?
        .subscriptions
        .current_plan(&auth_user.user_id)
        .await?;
    Ok(Json(current))
}

/// Create a Stripe billing portal session
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<PortalRequest>>,
) -> Result<Json<PortalResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let session = billing(&state)?
        .portal
        .create_session(&auth_user.user_id, request.return_url.as_deref())
        .await?;
    Ok(Json(session))
}

/// Re-read the user's subscription from Stripe
pub async fn sync_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SyncResponse>, ApiError> {
    let billing = billing(&state)?;

    let outcome = billing.subscriptions.sync_user(&auth_user.user_id).await?;
    let skipped_reason = match &outcome {
        ReconcileOutcome::Applied(_) => None,
        ReconcileOutcome::Skipped(reason) => Some(reason.to_string()),
    };
    let current = billing
        .subscriptions
        .current_plan(&auth_user.user_id)
        .await?;

    Ok(Json(SyncResponse {
        applied: outcome.is_applied(),
        skipped_reason,
        current,
    }))
}

/// Stripe webhook endpoint.
///
/// Answers 2xx once the event is handled or deliberately skipped. Rejected
/// signatures get a 400; handling failures get a 5xx so Stripe redelivers.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = billing(&state)?;
    let secret = billing.config().require_webhook_secret()?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    verify_signature(&body, signature, secret, unix_now())?;
    let event = parse_event(&body)?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    match billing.webhooks.handle_event(&event).await {
        Ok(outcome) => {
            let outcome = match outcome {
                WebhookOutcome::Applied => "applied",
                WebhookOutcome::Skipped(_) => "skipped",
                WebhookOutcome::Ignored => "ignored",
            };
            Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    received: true,
                    outcome,
                }),
            ))
        }
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                retryable = e.is_retryable(),
                "Webhook handling error"
            );
            Err(if e.is_retryable() {
                ApiError::ServiceUnavailable
            } else {
                ApiError::Internal
            })
        }
    }
}
