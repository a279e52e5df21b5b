//! Persistence seam for plans, profiles and subscriptions
//!
//! Every mutation is a single upsert keyed by `plan_id` or `user_id`; no
//! operation needs a multi-row transaction.

use async_trait::async_trait;
use saaskit_shared::{
    BillingInterval, EntitlementValue, Plan, SubscriptionStatus, UserProfile, UserSubscription,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Outcome recorded for a received webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventResult {
    Success,
    Skipped,
    Error,
}

impl WebhookEventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// Storage operations used by the billing core
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// All plans in configuration order
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>>;

    /// Insert or replace a plan. `position` is its index in the catalog file.
    async fn upsert_plan(&self, plan: &Plan, position: i32) -> BillingResult<()>;

    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>>;

    async fn find_profile_by_customer(&self, customer_id: &str)
        -> BillingResult<Option<UserProfile>>;

    /// Insert a profile unless one exists for the user. Returns the stored profile,
    /// which is the pre-existing one when the insert lost a race.
    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<UserProfile>;

    async fn get_subscription(&self, user_id: &str) -> BillingResult<Option<UserSubscription>>;

    /// Insert or replace the user's subscription record
    async fn upsert_subscription(&self, subscription: &UserSubscription) -> BillingResult<()>;

    /// Record receipt of a webhook event. Redeliveries bump the attempt counter.
    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<()>;

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> BillingResult<()>;
}

// =============================================================================
// Postgres
// =============================================================================

/// [`BillingStore`] backed by Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    plan_id: String,
    name: String,
    description: Option<String>,
    is_active: bool,
    monthly_price: Option<f64>,
    yearly_price: Option<f64>,
    price_currency: String,
    stripe_product_id: Option<String>,
    stripe_monthly_price_id: Option<String>,
    stripe_yearly_price_id: Option<String>,
    features: Json<Vec<String>>,
    entitlements: Json<BTreeMap<String, EntitlementValue>>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            plan_id: row.plan_id,
            name: row.name,
            description: row.description,
            is_active: row.is_active,
            monthly_price: row.monthly_price,
            yearly_price: row.yearly_price,
            price_currency: row.price_currency,
            stripe_product_id: row.stripe_product_id,
            stripe_monthly_price_id: row.stripe_monthly_price_id,
            stripe_yearly_price_id: row.stripe_yearly_price_id,
            features: row.features.0,
            entitlements: row.entitlements.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    user_id: String,
    stripe_customer_id: String,
    display_name: Option<String>,
    email: String,
}

impl From<ProfileRow> for UserProfile {
    fn from(row: ProfileRow) -> Self {
        UserProfile {
            user_id: row.user_id,
            stripe_customer_id: row.stripe_customer_id,
            display_name: row.display_name,
            email: row.email,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: String,
    plan_id: String,
    stripe_customer_id: String,
    stripe_subscription_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    billing_interval: Option<String>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for UserSubscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let status = SubscriptionStatus::from_str_lossy(&row.status);
        if !status.is_known() {
            return Err(BillingError::Persistence(format!(
                "Stored subscription for user {} has unknown status '{}'",
                row.user_id, row.status
            )));
        }
        let billing_interval = row
            .billing_interval
            .as_deref()
            .map(str::parse::<BillingInterval>)
            .transpose()?;

        Ok(UserSubscription {
            user_id: row.user_id,
            plan_id: row.plan_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            billing_interval,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
        })
    }
}

const PLAN_COLUMNS: &str = "plan_id, name, description, is_active, monthly_price, yearly_price, \
     price_currency, stripe_product_id, stripe_monthly_price_id, stripe_yearly_price_id, \
     features, entitlements";

const SUBSCRIPTION_COLUMNS: &str = "user_id, plan_id, stripe_customer_id, stripe_subscription_id, \
     status, current_period_start, current_period_end, cancel_at_period_end, billing_interval, \
     trial_start, trial_end";

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plans ORDER BY position ASC, plan_id ASC",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE plan_id = $1", PLAN_COLUMNS))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Plan::from))
    }

    async fn upsert_plan(&self, plan: &Plan, position: i32) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (
                plan_id, name, description, is_active, monthly_price, yearly_price,
                price_currency, stripe_product_id, stripe_monthly_price_id,
                stripe_yearly_price_id, features, entitlements, position, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
            ON CONFLICT (plan_id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                is_active = EXCLUDED.is_active,
                monthly_price = EXCLUDED.monthly_price,
                yearly_price = EXCLUDED.yearly_price,
                price_currency = EXCLUDED.price_currency,
                stripe_product_id = EXCLUDED.stripe_product_id,
                stripe_monthly_price_id = EXCLUDED.stripe_monthly_price_id,
                stripe_yearly_price_id = EXCLUDED.stripe_yearly_price_id,
                features = EXCLUDED.features,
                entitlements = EXCLUDED.entitlements,
                position = EXCLUDED.position,
                updated_at = NOW()
            "#,
        )
        .bind(&plan.plan_id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.is_active)
        .bind(plan.monthly_price)
        .bind(plan.yearly_price)
        .bind(&plan.price_currency)
        .bind(&plan.stripe_product_id)
        .bind(&plan.stripe_monthly_price_id)
        .bind(&plan.stripe_yearly_price_id)
        .bind(Json(&plan.features))
        .bind(Json(&plan.entitlements))
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT user_id, stripe_customer_id, display_name, email FROM user_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserProfile::from))
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT user_id, stripe_customer_id, display_name, email FROM user_profiles WHERE stripe_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserProfile::from))
    }

    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<UserProfile> {
        // DO NOTHING keeps the first customer id; the SELECT returns whichever row won
        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, stripe_customer_id, display_name, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.stripe_customer_id)
        .bind(&profile.display_name)
        .bind(&profile.email)
        .execute(&self.pool)
        .await?;

        self.get_profile(&profile.user_id).await?.ok_or_else(|| {
            BillingError::Persistence(format!("Profile for user {} vanished after insert", profile.user_id))
        })
    }

    async fn get_subscription(&self, user_id: &str) -> BillingResult<Option<UserSubscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM user_subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserSubscription::try_from).transpose()
    }

    async fn upsert_subscription(&self, sub: &UserSubscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (
                user_id, plan_id, stripe_customer_id, stripe_subscription_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                billing_interval, trial_start, trial_end, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                billing_interval = EXCLUDED.billing_interval,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                updated_at = NOW()
            "#,
        )
        .bind(&sub.user_id)
        .bind(&sub.plan_id)
        .bind(&sub.stripe_customer_id)
        .bind(&sub.stripe_subscription_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.billing_interval.map(|i| i.as_str()))
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_webhook_events (stripe_event_id, event_type, processing_result)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                attempts = stripe_webhook_events.attempts + 1,
                received_at = NOW()
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2, processed_at = NOW()
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
