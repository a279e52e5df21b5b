//! In-memory store and provider
//!
//! Test doubles for the billing seams. Both record enough about the calls they
//! receive for tests to assert on provider side effects.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use saaskit_shared::{BillingInterval, Plan, SubscriptionStatus, UserProfile, UserSubscription};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult, ProviderErrorKind};
use crate::provider::{
    BillingProvider, CustomerParams, PriceParams, ProductParams, RemotePrice, RemoteProduct,
    RemoteSubscription,
};
use crate::store::{BillingStore, WebhookEventResult};

// =============================================================================
// Store
// =============================================================================

/// A recorded webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredWebhookEvent {
    pub event_type: String,
    pub result: Option<WebhookEventResult>,
    pub error_message: Option<String>,
    pub attempts: u32,
}

#[derive(Default)]
struct StoreState {
    plans: Vec<(i32, Plan)>,
    profiles: HashMap<String, UserProfile>,
    subscriptions: HashMap<String, UserSubscription>,
    webhook_events: HashMap<String, StoredWebhookEvent>,
}

/// [`BillingStore`] kept in process memory
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<StoreState>,
    subscription_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a persistence error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of subscription upserts performed
    pub fn subscription_writes(&self) -> usize {
        self.subscription_writes.load(Ordering::SeqCst)
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    pub async fn webhook_event(&self, event_id: &str) -> Option<StoredWebhookEvent> {
        self.state.lock().await.webhook_events.get(event_id).cloned()
    }

    fn check_writable(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let state = self.state.lock().await;
        let mut plans = state.plans.clone();
        plans.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.plan_id.cmp(&b.1.plan_id)));
        Ok(plans.into_iter().map(|(_, plan)| plan).collect())
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let state = self.state.lock().await;
        Ok(state
            .plans
            .iter()
            .find(|(_, p)| p.plan_id == plan_id)
            .map(|(_, p)| p.clone()))
    }

    async fn upsert_plan(&self, plan: &Plan, position: i32) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        match state.plans.iter_mut().find(|(_, p)| p.plan_id == plan.plan_id) {
            Some(entry) => *entry = (position, plan.clone()),
            None => state.plans.push((position, plan.clone())),
        }
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        Ok(self.state.lock().await.profiles.get(user_id).cloned())
    }

    async fn find_profile_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserProfile>> {
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .values()
            .find(|p| p.stripe_customer_id == customer_id)
            .cloned())
    }

    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<UserProfile> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        Ok(state
            .profiles
            .entry(profile.user_id.clone())
            .or_insert_with(|| profile.clone())
            .clone())
    }

    async fn get_subscription(&self, user_id: &str) -> BillingResult<Option<UserSubscription>> {
        Ok(self.state.lock().await.subscriptions.get(user_id).cloned())
    }

    async fn upsert_subscription(&self, subscription: &UserSubscription) -> BillingResult<()> {
        self.check_writable()?;
        self.subscription_writes.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id.clone(), subscription.clone());
        Ok(())
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let entry = state
            .webhook_events
            .entry(event_id.to_string())
            .or_insert_with(|| StoredWebhookEvent {
                event_type: event_type.to_string(),
                result: None,
                error_message: None,
                attempts: 0,
            });
        entry.attempts += 1;
        entry.result = None;
        Ok(())
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.webhook_events.get_mut(event_id) {
            entry.result = Some(result);
            entry.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }
}

// =============================================================================
// Provider
// =============================================================================

#[derive(Default)]
struct ProviderState {
    products: Vec<RemoteProduct>,
    prices: Vec<RemotePrice>,
    customers: Vec<(String, CustomerParams)>,
    subscriptions: Vec<RemoteSubscription>,
    payment_methods: HashMap<String, Option<String>>,
    default_payment_methods: HashMap<String, String>,
    calls: Vec<String>,
    failing_plans: HashSet<String>,
    failing_emails: HashSet<String>,
}

/// [`BillingProvider`] that keeps products, prices and subscriptions in memory
#[derive(Default)]
pub struct MockBillingProvider {
    state: Mutex<ProviderState>,
    next_id: AtomicUsize,
    products_created: AtomicUsize,
    products_updated: AtomicUsize,
    prices_created: AtomicUsize,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self, prefix: &str) -> String {
        format!("{}_mock_{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn products_created(&self) -> usize {
        self.products_created.load(Ordering::SeqCst)
    }

    pub fn products_updated(&self) -> usize {
        self.products_updated.load(Ordering::SeqCst)
    }

    pub fn prices_created(&self) -> usize {
        self.prices_created.load(Ordering::SeqCst)
    }

    /// Fail product writes for a plan with a network error
    pub async fn fail_plan(&self, plan_id: &str) {
        self.state.lock().await.failing_plans.insert(plan_id.to_string());
    }

    /// Fail customer creation for an email with an authentication error
    pub async fn fail_customer_email(&self, email: &str) {
        self.state.lock().await.failing_emails.insert(email.to_string());
    }

    pub async fn products(&self) -> Vec<RemoteProduct> {
        self.state.lock().await.products.clone()
    }

    pub async fn prices(&self) -> Vec<RemotePrice> {
        self.state.lock().await.prices.clone()
    }

    pub async fn price(&self, price_id: &str) -> Option<RemotePrice> {
        self.state
            .lock()
            .await
            .prices
            .iter()
            .find(|p| p.id == price_id)
            .cloned()
    }

    /// Names of the provider calls made so far, in order
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn customer_count(&self) -> usize {
        self.state.lock().await.customers.len()
    }

    pub async fn default_payment_method(&self, customer_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .default_payment_methods
            .get(customer_id)
            .cloned()
    }

    /// Drop all metadata from a product, as if edited in the provider dashboard
    pub async fn strip_metadata(&self, product_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(product) = state.products.iter_mut().find(|p| p.id == product_id) {
            product.metadata.clear();
        }
    }

    /// Seed a subscription so that reads return it
    pub async fn insert_subscription(&self, subscription: RemoteSubscription) {
        let mut state = self.state.lock().await;
        state.subscriptions.retain(|s| s.id != subscription.id);
        state.subscriptions.push(subscription);
    }

    async fn record(&self, call: impl Into<String>) {
        self.state.lock().await.calls.push(call.into());
    }
}

fn period_length(interval: Option<BillingInterval>) -> Duration {
    match interval {
        Some(BillingInterval::Year) => Duration::days(365),
        _ => Duration::days(30),
    }
}

#[async_trait]
impl BillingProvider for MockBillingProvider {
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Option<RemoteProduct>> {
        self.record("retrieve_product").await;
        let state = self.state.lock().await;
        Ok(state.products.iter().find(|p| p.id == product_id).cloned())
    }

    async fn find_product_by_plan_id(&self, plan_id: &str) -> BillingResult<Option<RemoteProduct>> {
        self.record("find_product_by_plan_id").await;
        let state = self.state.lock().await;
        Ok(state
            .products
            .iter()
            .find(|p| p.plan_id() == Some(plan_id))
            .cloned())
    }

    async fn list_products(&self) -> BillingResult<Vec<RemoteProduct>> {
        self.record("list_products").await;
        Ok(self.state.lock().await.products.clone())
    }

    async fn create_product(&self, params: &ProductParams) -> BillingResult<RemoteProduct> {
        self.record("create_product").await;
        let mut state = self.state.lock().await;
        if state.failing_plans.contains(&params.plan_id) {
            return Err(BillingError::provider(
                ProviderErrorKind::Network,
                format!("connection reset while creating product for {}", params.plan_id),
            ));
        }

        let product = RemoteProduct {
            id: self.id("prod"),
            name: params.name.clone(),
            description: params.description.clone(),
            active: params.active,
            metadata: params.metadata(),
        };
        state.products.push(product.clone());
        self.products_created.fetch_add(1, Ordering::SeqCst);
        Ok(product)
    }

    async fn update_product(
        &self,
        product_id: &str,
        params: &ProductParams,
    ) -> BillingResult<RemoteProduct> {
        self.record("update_product").await;
        let mut state = self.state.lock().await;
        if state.failing_plans.contains(&params.plan_id) {
            return Err(BillingError::provider(
                ProviderErrorKind::Network,
                format!("connection reset while updating product for {}", params.plan_id),
            ));
        }

        let product = state
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| BillingError::provider(ProviderErrorKind::InvalidRequest, "No such product"))?;
        product.name = params.name.clone();
        product.description = params.description.clone();
        product.active = params.active;
        product.metadata.extend(params.metadata());
        self.products_updated.fetch_add(1, Ordering::SeqCst);
        Ok(product.clone())
    }

    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>> {
        self.record("list_prices").await;
        let state = self.state.lock().await;
        Ok(state
            .prices
            .iter()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn create_price(&self, params: &PriceParams) -> BillingResult<RemotePrice> {
        self.record("create_price").await;
        let mut state = self.state.lock().await;
        for price in state.prices.iter_mut() {
            if price.lookup_key.as_deref() == Some(params.lookup_key.as_str()) {
                price.lookup_key = None;
            }
        }

        let price = RemotePrice {
            id: self.id("price"),
            product_id: params.product_id.clone(),
            unit_amount: Some(params.unit_amount),
            currency: params.currency.clone(),
            interval: Some(params.interval),
            lookup_key: Some(params.lookup_key.clone()),
            active: true,
        };
        state.prices.push(price.clone());
        self.prices_created.fetch_add(1, Ordering::SeqCst);
        Ok(price)
    }

    async fn create_customer(&self, params: &CustomerParams) -> BillingResult<String> {
        self.record("create_customer").await;
        let mut state = self.state.lock().await;
        if state.failing_emails.contains(&params.email) {
            return Err(BillingError::provider(
                ProviderErrorKind::Authentication,
                "Invalid API Key provided",
            ));
        }
        let id = self.id("cus");
        state.customers.push((id.clone(), params.clone()));
        Ok(id)
    }

    async fn create_payment_method(&self, token: &str) -> BillingResult<String> {
        self.record("create_payment_method").await;
        if token == "tok_chargeDeclined" {
            return Err(BillingError::provider(
                ProviderErrorKind::CardDeclined,
                "Your card was declined.",
            ));
        }
        let id = self.id("pm");
        self.state.lock().await.payment_methods.insert(id.clone(), None);
        Ok(id)
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<()> {
        self.record("attach_payment_method").await;
        let mut state = self.state.lock().await;
        match state.payment_methods.get_mut(payment_method_id) {
            Some(owner) => {
                *owner = Some(customer_id.to_string());
                Ok(())
            }
            None => Err(BillingError::provider(
                ProviderErrorKind::InvalidRequest,
                "No such PaymentMethod",
            )),
        }
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        self.record("set_default_payment_method").await;
        let mut state = self.state.lock().await;
        let attached = state.payment_methods.get(payment_method_id).cloned().flatten();
        if attached.as_deref() != Some(customer_id) {
            return Err(BillingError::provider(
                ProviderErrorKind::InvalidRequest,
                "PaymentMethod must be attached to the customer before it can be the default",
            ));
        }
        state
            .default_payment_methods
            .insert(customer_id.to_string(), payment_method_id.to_string());
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        default_payment_method: Option<&str>,
    ) -> BillingResult<RemoteSubscription> {
        self.record("create_subscription").await;
        let mut state = self.state.lock().await;
        let price = state
            .prices
            .iter()
            .find(|p| p.id == price_id)
            .cloned()
            .ok_or_else(|| BillingError::provider(ProviderErrorKind::InvalidRequest, "No such price"))?;

        // Without a usable payment method the first invoice cannot be paid
        let has_payment_method = default_payment_method.is_some()
            || state.default_payment_methods.contains_key(customer_id);
        let status = if has_payment_method {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Incomplete
        };

        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let subscription = RemoteSubscription {
            id: self.id("sub"),
            customer_id: customer_id.to_string(),
            status,
            price_id: Some(price.id.clone()),
            interval: price.interval,
            current_period_start: Some(now),
            current_period_end: Some(now + period_length(price.interval)),
            cancel_at_period_end: false,
            trial_start: None,
            trial_end: None,
            created: Some(now),
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<RemoteSubscription> {
        self.record("retrieve_subscription").await;
        let state = self.state.lock().await;
        state
            .subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>> {
        self.record("list_customer_subscriptions").await;
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == customer_id && s.status != SubscriptionStatus::Canceled)
            .cloned()
            .collect())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        self.record("create_portal_session").await;
        Ok(format!(
            "https://billing.example.test/session/{}?customer={}&return_url={}",
            self.id("bps"),
            customer_id,
            return_url
        ))
    }
}
