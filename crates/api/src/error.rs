//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use saaskit_billing::{BillingError, ProviderErrorKind};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Rate limiting
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    // Billing errors
    #[error("Payment required: {0}")]
    PaymentRequired(String),
    #[error("Billing provider error: {0}")]
    Provider(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            // Rate limiting
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS", msg.clone()),

            // Billing
            ApiError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", msg.clone()),
            ApiError::Provider(msg) => (StatusCode::BAD_GATEWAY, "BILLING_PROVIDER_ERROR", msg.clone()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::Validation(e) => ApiError::Validation(e.to_string()),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg.clone()),
            BillingError::NotFound(_) => ApiError::NotFound,
            // Provider text never reaches the client
            BillingError::Provider { kind, message } => {
                tracing::error!(kind = %kind, error = %message, "Billing provider error");
                let user_message = err.user_message().to_string();
                match kind {
                    ProviderErrorKind::CardDeclined => ApiError::PaymentRequired(user_message),
                    ProviderErrorKind::RateLimited => ApiError::TooManyRequests(user_message),
                    ProviderErrorKind::InvalidRequest => ApiError::BadRequest(user_message),
                    _ => ApiError::Provider(user_message),
                }
            }
            BillingError::Persistence(msg) => {
                tracing::error!(error = %msg, "Billing persistence error");
                ApiError::Database(msg.clone())
            }
            BillingError::Config(msg) => {
                tracing::error!(error = %msg, "Billing misconfigured");
                ApiError::ServiceUnavailable
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::InvalidPayload(msg) => ApiError::BadRequest(msg.clone()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_decline_uses_fixed_message() {
        let err: ApiError = BillingError::provider(
            ProviderErrorKind::CardDeclined,
            "Your card has insufficient funds. (req_123)",
        )
        .into();

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::Persistence("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                BillingError::provider(ProviderErrorKind::Network, "reset"),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BillingError::provider(ProviderErrorKind::RateLimited, "slow down"),
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
