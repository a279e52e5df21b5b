//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret (only needed by the webhook endpoint)
    pub webhook_secret: Option<String>,
    /// Base URL of the web app, used for portal return URLs
    pub app_base_url: String,
    /// Path of the billing settings page under `app_base_url`
    pub billing_return_path: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            billing_return_path: std::env::var("BILLING_RETURN_PATH")
                .unwrap_or_else(|_| "/settings/billing".to_string()),
        })
    }

    /// Webhook secret, or a configuration error when webhooks are not set up
    pub fn require_webhook_secret(&self) -> BillingResult<&str> {
        self.webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))
    }

    /// Default return URL for portal sessions
    pub fn default_return_url(&self) -> String {
        format!("{}{}", self.app_base_url, self.billing_return_path)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_return_url() {
        let config = StripeConfig {
            secret_key: "sk_test_123".into(),
            webhook_secret: None,
            app_base_url: "https://app.example.com".into(),
            billing_return_path: "/settings/billing".into(),
        };
        assert_eq!(config.default_return_url(), "https://app.example.com/settings/billing");
        assert!(matches!(config.require_webhook_secret(), Err(BillingError::Config(_))));
    }
}
