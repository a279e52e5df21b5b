//! Stripe Billing Portal

use std::sync::Arc;

use serde::Serialize;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::BillingStore;

/// Portal service for Stripe billing portal sessions
#[derive(Clone)]
pub struct PortalService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    app_base_url: String,
    default_return_url: String,
}

impl PortalService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        config: &StripeConfig,
    ) -> Self {
        Self {
            provider,
            store,
            app_base_url: config.app_base_url.clone(),
            default_return_url: config.default_return_url(),
        }
    }

    /// Create a billing portal session for a user
    pub async fn create_session(
        &self,
        user_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<PortalResponse> {
        let return_url = match return_url {
            Some(url) => self.check_return_url(url)?,
            None => self.default_return_url.clone(),
        };

        let profile = self
            .store
            .get_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User profile {}", user_id)))?;

        let url = self
            .provider
            .create_portal_session(&profile.stripe_customer_id, &return_url)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %profile.stripe_customer_id,
            "Created billing portal session"
        );

        Ok(PortalResponse { url })
    }

    /// Only same-origin return URLs are accepted
    fn check_return_url(&self, url: &str) -> BillingResult<String> {
        let base = self.app_base_url.trim_end_matches('/');
        let same_origin = url == base
            || url
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'));
        if same_origin {
            Ok(url.to_string())
        } else {
            Err(BillingError::InvalidInput(format!(
                "Return URL must stay on {}",
                base
            )))
        }
    }
}

/// Response for creating a portal session
#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}
