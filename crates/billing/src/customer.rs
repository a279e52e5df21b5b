//! Customer creation for newly registered users

use std::sync::Arc;

use saaskit_shared::{UserProfile, UserSubscription};

use crate::error::BillingResult;
use crate::provider::{BillingProvider, CustomerParams};
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionReconciler;

/// Result of the post-registration workflow
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub profile: UserProfile,
    /// Present when this call created the free-plan record
    pub subscription: Option<UserSubscription>,
    /// False when the user had already been registered
    pub created: bool,
}

/// Customer service for the post-registration workflow
#[derive(Clone)]
pub struct CustomerService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    reconciler: SubscriptionReconciler,
}

impl CustomerService {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        let reconciler = SubscriptionReconciler::new(provider.clone(), store.clone());
        Self {
            provider,
            store,
            reconciler,
        }
    }

    /// Give a newly registered user a provider customer, a profile and the free plan.
    ///
    /// Safe to call repeatedly: an existing profile is returned as is, so the
    /// customer id is created at most once per user.
    pub async fn register_user(
        &self,
        user_id: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> BillingResult<Registration> {
        if let Some(profile) = self.store.get_profile(user_id).await? {
            tracing::info!(
                user_id = %user_id,
                customer_id = %profile.stripe_customer_id,
                "User already registered, keeping existing customer"
            );
            // Repair a profile whose free-plan write failed last time
            let subscription = match self.store.get_subscription(user_id).await? {
                Some(_) => None,
                None => Some(self.reconciler.write_free_plan(&profile).await?),
            };
            return Ok(Registration {
                profile,
                subscription,
                created: false,
            });
        }

        let customer_id = self
            .provider
            .create_customer(&CustomerParams {
                user_id: user_id.to_string(),
                email: email.to_string(),
                name: display_name.map(str::to_string),
            })
            .await?;

        let candidate = UserProfile {
            user_id: user_id.to_string(),
            stripe_customer_id: customer_id.clone(),
            display_name: display_name.map(str::to_string),
            email: email.to_string(),
        };
        let profile = self.store.insert_profile(&candidate).await?;

        if profile.stripe_customer_id != customer_id {
            tracing::warn!(
                user_id = %user_id,
                kept_customer_id = %profile.stripe_customer_id,
                unused_customer_id = %customer_id,
                "Concurrent registration won the race, new customer left unused"
            );
        }

        let subscription = match self.store.get_subscription(user_id).await? {
            Some(_) => None,
            None => Some(self.reconciler.write_free_plan(&profile).await?),
        };

        tracing::info!(
            user_id = %user_id,
            customer_id = %profile.stripe_customer_id,
            "Registered user for billing"
        );

        Ok(Registration {
            profile,
            subscription,
            created: true,
        })
    }
}
