//! Subscription state reconciliation
//!
//! Converts provider subscription snapshots into the per-user
//! [`UserSubscription`] read model. Every write carries the provider's full
//! current state, so duplicate and reordered deliveries converge (last write wins).

use std::fmt;
use std::sync::Arc;

use saaskit_shared::{Plan, UserProfile, UserSubscription};
use serde::Serialize;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, RemoteSubscription};
use crate::store::BillingStore;

/// Why a provider subscription was not written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No profile carries the subscription's customer id
    UnknownCustomer(String),
    /// Status outside the known vocabulary
    UnknownStatus,
    /// Subscription has no priced line item
    MissingPrice,
    /// Price id not present in the catalog
    UnknownPrice(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCustomer(id) => write!(f, "unknown customer {}", id),
            Self::UnknownStatus => f.write_str("unknown subscription status"),
            Self::MissingPrice => f.write_str("subscription has no price"),
            Self::UnknownPrice(id) => write!(f, "price {} is not in the catalog", id),
        }
    }
}

/// Result of reconciling one provider subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(UserSubscription),
    Skipped(SkipReason),
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// What the UI shows as the user's plan
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPlan {
    pub subscription: UserSubscription,
    /// Plan the user gets features from; the free plan once a subscription has ended
    pub plan: Plan,
    pub effective_plan_id: String,
    pub has_access: bool,
}

/// Reconciles provider subscriptions into stored per-user records
#[derive(Clone)]
pub struct SubscriptionReconciler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
}

impl SubscriptionReconciler {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        let catalog = PlanCatalog::new(store.clone());
        Self {
            provider,
            store,
            catalog,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Derive the canonical record from a provider subscription and upsert it
    pub async fn reconcile(&self, remote: &RemoteSubscription) -> BillingResult<ReconcileOutcome> {
        let Some(profile) = self.store.find_profile_by_customer(&remote.customer_id).await? else {
            tracing::warn!(
                subscription_id = %remote.id,
                customer_id = %remote.customer_id,
                "No user profile for subscription customer, skipping"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownCustomer(
                remote.customer_id.clone(),
            )));
        };

        if !remote.status.is_known() {
            tracing::warn!(
                user_id = %profile.user_id,
                subscription_id = %remote.id,
                "Subscription has an unrecognized status, skipping"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownStatus));
        }

        let Some(price_id) = remote.price_id.as_deref() else {
            tracing::warn!(
                user_id = %profile.user_id,
                subscription_id = %remote.id,
                "Subscription has no price, skipping"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::MissingPrice));
        };

        let Some(plan) = self.catalog.get_plan_by_price_id(price_id).await? else {
            tracing::warn!(
                user_id = %profile.user_id,
                subscription_id = %remote.id,
                price_id = %price_id,
                "Subscription price is not in the catalog, skipping (run catalog sync)"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownPrice(
                price_id.to_string(),
            )));
        };

        let record = UserSubscription {
            user_id: profile.user_id.clone(),
            plan_id: plan.plan_id.clone(),
            stripe_customer_id: remote.customer_id.clone(),
            stripe_subscription_id: Some(remote.id.clone()),
            status: remote.status,
            current_period_start: remote.current_period_start,
            current_period_end: remote.current_period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
            billing_interval: remote.interval.or_else(|| plan.interval_of_price(price_id)),
            trial_start: remote.trial_start,
            trial_end: remote.trial_end,
        };

        self.store.upsert_subscription(&record).await?;

        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %remote.id,
            plan_id = %record.plan_id,
            status = %record.status,
            "Reconciled subscription"
        );

        Ok(ReconcileOutcome::Applied(record))
    }

    /// Write the synthetic free-plan record for a user
    pub async fn write_free_plan(&self, profile: &UserProfile) -> BillingResult<UserSubscription> {
        let record = UserSubscription::free(&profile.user_id, &profile.stripe_customer_id);
        self.store.upsert_subscription(&record).await?;

        tracing::info!(user_id = %profile.user_id, "Assigned free plan");
        Ok(record)
    }

    /// Re-read the user's subscriptions from the provider and store the current one.
    ///
    /// Falls back to the free plan when the customer has no live subscription.
    pub async fn sync_user(&self, user_id: &str) -> BillingResult<ReconcileOutcome> {
        let profile = self
            .store
            .get_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User profile {}", user_id)))?;

        let subscriptions = self
            .provider
            .list_customer_subscriptions(&profile.stripe_customer_id)
            .await?;

        let current = subscriptions
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .max_by_key(|s| (s.status.grants_access(), s.created));

        match current {
            Some(remote) => self.reconcile(&remote).await,
            None => {
                tracing::info!(user_id = %user_id, "No live provider subscription");
                let record = self.write_free_plan(&profile).await?;
                Ok(ReconcileOutcome::Applied(record))
            }
        }
    }

    /// The user's stored subscription and the plan it currently entitles them to
    pub async fn current_plan(&self, user_id: &str) -> BillingResult<CurrentPlan> {
        let subscription = self
            .store
            .get_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription for user {}", user_id)))?;

        let plan = if subscription.status.is_terminal() {
            self.catalog.get_free_plan().await?
        } else {
            match self.catalog.get_plan_by_id(&subscription.plan_id).await? {
                Some(plan) => plan,
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        plan_id = %subscription.plan_id,
                        "Subscribed plan missing from catalog, showing free plan"
                    );
                    self.catalog.get_free_plan().await?
                }
            }
        };

        Ok(CurrentPlan {
            has_access: subscription.status.grants_access(),
            effective_plan_id: plan.plan_id.clone(),
            plan,
            subscription,
        })
    }
}
