//! Billing provider seam
//!
//! The catalog synchronizer, the reconciler and the provisioning workflow talk to
//! the billing provider only through [`BillingProvider`]. [`crate::StripeClient`]
//! implements it against the live API, [`crate::memory::MockBillingProvider`] in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use saaskit_shared::{
    BillingInterval, Plan, SubscriptionStatus, PLAN_ID_METADATA_KEY, USER_ID_METADATA_KEY,
};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Metadata key holding the JSON-serialized feature list of a product
pub const FEATURES_METADATA_KEY: &str = "features";

// =============================================================================
// Catalog objects
// =============================================================================

/// A product as seen on the provider side
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteProduct {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub metadata: HashMap<String, String>,
}

impl RemoteProduct {
    /// Internal plan id this product is tagged with
    pub fn plan_id(&self) -> Option<&str> {
        self.metadata.get(PLAN_ID_METADATA_KEY).map(String::as_str)
    }

    pub fn features_metadata(&self) -> Option<&str> {
        self.metadata.get(FEATURES_METADATA_KEY).map(String::as_str)
    }

    /// Whether the mutable fields differ from what `params` would write
    pub fn differs_from(&self, params: &ProductParams) -> bool {
        self.name != params.name
            || self.description.as_deref().unwrap_or_default()
                != params.description.as_deref().unwrap_or_default()
            || self.features_metadata() != Some(params.features.as_str())
            || self.plan_id() != Some(params.plan_id.as_str())
            || self.active != params.active
    }
}

/// A recurring price as seen on the provider side
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePrice {
    pub id: String,
    pub product_id: String,
    pub unit_amount: Option<i64>,
    pub currency: String,
    pub interval: Option<BillingInterval>,
    pub lookup_key: Option<String>,
    pub active: bool,
}

impl RemotePrice {
    /// Whether this price can serve `params` unchanged
    pub fn matches(&self, params: &PriceParams) -> bool {
        self.active
            && self.product_id == params.product_id
            && self.unit_amount == Some(params.unit_amount)
            && self.currency.eq_ignore_ascii_case(&params.currency)
            && self.interval == Some(params.interval)
    }
}

/// Fields written when creating or updating a product
#[derive(Debug, Clone, PartialEq)]
pub struct ProductParams {
    pub plan_id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    /// JSON array of feature strings
    pub features: String,
}

impl ProductParams {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone().filter(|d| !d.is_empty()),
            active: plan.is_active,
            features: plan.features_metadata(),
        }
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (PLAN_ID_METADATA_KEY.to_string(), self.plan_id.clone()),
            (FEATURES_METADATA_KEY.to_string(), self.features.clone()),
        ])
    }
}

/// Fields of a new recurring price. Prices are never updated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceParams {
    pub plan_id: String,
    pub product_id: String,
    pub unit_amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub lookup_key: String,
}

impl PriceParams {
    /// Params for one interval of a plan, or `None` when the interval carries no price
    pub fn for_plan(plan: &Plan, product_id: &str, interval: BillingInterval) -> Option<Self> {
        Some(Self {
            plan_id: plan.plan_id.clone(),
            product_id: product_id.to_string(),
            unit_amount: plan.unit_amount(interval)?,
            currency: plan.price_currency.to_lowercase(),
            interval,
            lookup_key: plan.lookup_key(interval),
        })
    }
}

/// Fields of a new customer
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerParams {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

impl CustomerParams {
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([(USER_ID_METADATA_KEY.to_string(), self.user_id.clone())])
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Provider subscription, reduced to the fields the reconciler copies
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub interval: Option<BillingInterval>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub created: Option<OffsetDateTime>,
}

impl RemoteSubscription {
    /// Parse the `data.object` of a subscription webhook event.
    ///
    /// Newer API versions moved the period boundaries onto subscription items, so
    /// those fall back to the first item when absent at the top level.
    pub fn from_json(value: &serde_json::Value) -> BillingResult<Self> {
        let raw: RawSubscription = serde_json::from_value(value.clone())?;
        raw.try_into()
    }
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    id: String,
    customer: RawExpandable,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    trial_start: Option<i64>,
    trial_end: Option<i64>,
    created: Option<i64>,
    #[serde(default)]
    items: RawList<RawSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawExpandable {
    Id(String),
    Object { id: String },
}

impl RawExpandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> Default for RawList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionItem {
    price: Option<RawPrice>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    id: String,
    recurring: Option<RawRecurring>,
}

#[derive(Debug, Deserialize)]
struct RawRecurring {
    interval: String,
}

impl TryFrom<RawSubscription> for RemoteSubscription {
    type Error = BillingError;

    fn try_from(raw: RawSubscription) -> BillingResult<Self> {
        let item = raw.items.data.into_iter().next();
        let (price_id, interval, item_start, item_end) = match item {
            Some(item) => {
                let interval = item
                    .price
                    .as_ref()
                    .and_then(|p| p.recurring.as_ref())
                    .and_then(|r| r.interval.parse::<BillingInterval>().ok());
                (
                    item.price.map(|p| p.id),
                    interval,
                    item.current_period_start,
                    item.current_period_end,
                )
            }
            None => (None, None, None, None),
        };

        Ok(Self {
            id: raw.id,
            customer_id: raw.customer.into_id(),
            status: SubscriptionStatus::from_str_lossy(&raw.status),
            price_id,
            interval,
            current_period_start: timestamp(raw.current_period_start.or(item_start))?,
            current_period_end: timestamp(raw.current_period_end.or(item_end))?,
            cancel_at_period_end: raw.cancel_at_period_end,
            trial_start: timestamp(raw.trial_start)?,
            trial_end: timestamp(raw.trial_end)?,
            created: timestamp(raw.created)?,
        })
    }
}

/// Convert a provider unix timestamp
pub fn timestamp(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(|s| {
        OffsetDateTime::from_unix_timestamp(s)
            .map_err(|e| BillingError::InvalidPayload(format!("Invalid timestamp {}: {}", s, e)))
    })
    .transpose()
}

// =============================================================================
// Provider trait
// =============================================================================

/// Operations the billing core needs from the payment provider
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch a product by id. `None` when the provider no longer knows it.
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Option<RemoteProduct>>;

    /// Find a product tagged with `plan_id` metadata
    async fn find_product_by_plan_id(&self, plan_id: &str) -> BillingResult<Option<RemoteProduct>>;

    /// All products, active or not
    async fn list_products(&self) -> BillingResult<Vec<RemoteProduct>>;

    async fn create_product(&self, params: &ProductParams) -> BillingResult<RemoteProduct>;

    async fn update_product(
        &self,
        product_id: &str,
        params: &ProductParams,
    ) -> BillingResult<RemoteProduct>;

    /// Recurring prices of a product
    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>>;

    /// Create a price, moving the lookup key over from any older price holding it
    async fn create_price(&self, params: &PriceParams) -> BillingResult<RemotePrice>;

    /// Create a customer tagged with the user id. Returns the customer id.
    async fn create_customer(&self, params: &CustomerParams) -> BillingResult<String>;

    /// Create a card payment method from a test token. Returns the payment method id.
    async fn create_payment_method(&self, token: &str) -> BillingResult<String>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<()>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        default_payment_method: Option<&str>,
    ) -> BillingResult<RemoteSubscription>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<RemoteSubscription>;

    /// Subscriptions of a customer that are not canceled
    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>>;

    /// Create a hosted portal session. Returns the session URL.
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;
}
