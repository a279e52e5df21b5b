//! Validation errors for plan definitions

use thiserror::Error;

use crate::types::BillingInterval;

/// A malformed plan definition. Raised before any provider call is made.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Plan '{plan_id}' is missing required field {field}")]
    MissingField { plan_id: String, field: &'static str },

    #[error("Duplicate plan id: {0}")]
    DuplicatePlanId(String),

    #[error("Plan '{plan_id}' has an invalid {interval} price: {price}")]
    InvalidPrice {
        plan_id: String,
        interval: BillingInterval,
        price: f64,
    },

    #[error("Plan '{plan_id}' has an invalid currency code: {currency}")]
    InvalidCurrency { plan_id: String, currency: String },

    #[error("Invalid billing interval: {0}")]
    InvalidInterval(String),

    #[error("The free plan cannot carry a price")]
    PricedFreePlan,

    #[error("Invalid catalog file: {0}")]
    Malformed(String),
}
