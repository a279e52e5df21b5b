//! Billing error types

use saaskit_shared::ValidationError;
use thiserror::Error;

/// Category of a billing or identity provider failure.
///
/// The category, not the raw provider text, decides retry behavior and the
/// message shown to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    CardDeclined,
    RateLimited,
    Network,
    Authentication,
    InvalidRequest,
    Identity,
    Other,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardDeclined => "card_declined",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::InvalidRequest => "invalid_request",
            Self::Identity => "identity",
            Self::Other => "other",
        }
    }

    /// Classify an HTTP status returned by a provider API
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            402 => Self::CardDeclined,
            408 => Self::Network,
            429 => Self::RateLimited,
            400..=499 => Self::InvalidRequest,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("Database error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            message: message.into(),
        }
    }

    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Webhook handlers answer retryable failures with a 5xx so the provider redelivers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { kind, .. } => !matches!(
                kind,
                ProviderErrorKind::CardDeclined | ProviderErrorKind::InvalidRequest
            ),
            Self::Persistence(_) => true,
            _ => false,
        }
    }

    /// Fixed, human-readable message for UI surfaces. Never exposes provider text.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Provider { kind, .. } => match kind {
                ProviderErrorKind::CardDeclined => {
                    "Your card was declined. Please use a different payment method."
                }
                ProviderErrorKind::RateLimited => {
                    "Too many requests. Please wait a moment and try again."
                }
                ProviderErrorKind::Network => {
                    "A network error occurred. Please check your connection and try again."
                }
                ProviderErrorKind::Authentication => {
                    "Authentication with the billing provider failed. Please contact support."
                }
                _ => GENERIC_MESSAGE,
            },
            _ => GENERIC_MESSAGE,
        }
    }
}

const GENERIC_MESSAGE: &str = "An unexpected billing error occurred. Please try again later.";

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        let kind = match &err {
            stripe::StripeError::Stripe(request) => {
                if request.decline_code.is_some() {
                    ProviderErrorKind::CardDeclined
                } else {
                    ProviderErrorKind::from_http_status(request.http_status)
                }
            }
            stripe::StripeError::Timeout | stripe::StripeError::ClientError(_) => {
                ProviderErrorKind::Network
            }
            _ => ProviderErrorKind::Other,
        };
        BillingError::provider(kind, err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidPayload(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
