//! [`BillingProvider`] implementation backed by the Stripe API
//!
//! Typed async-stripe calls are used where the generated params cover what we
//! need; form posts cover lookup-key transfer and payment method plumbing.

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use saaskit_shared::{BillingInterval, SubscriptionStatus};
use serde::Deserialize;
use stripe::{
    BillingPortalSession, CreateBillingPortalSession, CreateCustomer, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, IdOrCreate, ListPrices, ListProducts,
    ListSubscriptions, Price, PriceId, Product, ProductId, RecurringInterval, StripeError,
    Subscription, SubscriptionId,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    timestamp, BillingProvider, CustomerParams, PriceParams, ProductParams, RemotePrice,
    RemoteProduct, RemoteSubscription,
};

const PAGE_SIZE: u64 = 100;

/// Form-encoded request body; bracketed keys address nested params
type Form = BTreeMap<String, String>;

fn form<const N: usize>(fields: [(&str, &str); N]) -> Form {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

fn parse_id<T: std::str::FromStr>(kind: &str, id: &str) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    id.parse::<T>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid {} ID '{}': {}", kind, id, e)))
}

/// Walks a cursor-paginated list until the last page, feeding each page's
/// final item back as `starting_after`.
async fn collect_pages<T, C, F, Fut>(
    mut fetch_page: F,
    cursor: fn(&T) -> C,
) -> BillingResult<Vec<T>>
where
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = BillingResult<(Vec<T>, bool)>>,
{
    let mut items = Vec::new();
    let mut starting_after = None;

    loop {
        let (page, has_more) = fetch_page(starting_after.take()).await?;
        starting_after = page.last().map(cursor);
        items.extend(page);

        if !has_more || starting_after.is_none() {
            break;
        }
    }

    Ok(items)
}

fn is_not_found(err: &StripeError) -> bool {
    matches!(err, StripeError::Stripe(request) if request.http_status == 404)
}

fn map_product(product: Product) -> RemoteProduct {
    RemoteProduct {
        id: product.id.to_string(),
        name: product.name.unwrap_or_default(),
        description: product.description,
        active: product.active.unwrap_or(false),
        metadata: product.metadata.unwrap_or_default(),
    }
}

fn map_interval(interval: &RecurringInterval) -> Option<BillingInterval> {
    match interval {
        RecurringInterval::Month => Some(BillingInterval::Month),
        RecurringInterval::Year => Some(BillingInterval::Year),
        _ => None,
    }
}

fn map_price(price: Price) -> RemotePrice {
    RemotePrice {
        id: price.id.to_string(),
        product_id: price
            .product
            .as_ref()
            .map(|p| p.id().to_string())
            .unwrap_or_default(),
        unit_amount: price.unit_amount,
        currency: price.currency.map(|c| c.to_string()).unwrap_or_default(),
        interval: price.recurring.as_ref().and_then(|r| map_interval(&r.interval)),
        lookup_key: price.lookup_key,
        active: price.active.unwrap_or(false),
    }
}

fn map_status(status: &stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn map_subscription(sub: Subscription) -> BillingResult<RemoteSubscription> {
    let price = sub.items.data.first().and_then(|item| item.price.as_ref());

    Ok(RemoteSubscription {
        id: sub.id.to_string(),
        customer_id: sub.customer.id().to_string(),
        status: map_status(&sub.status),
        price_id: price.map(|p| p.id.to_string()),
        interval: price
            .and_then(|p| p.recurring.as_ref())
            .and_then(|r| map_interval(&r.interval)),
        current_period_start: timestamp(Some(sub.current_period_start))?,
        current_period_end: timestamp(Some(sub.current_period_end))?,
        cancel_at_period_end: sub.cancel_at_period_end,
        trial_start: timestamp(sub.trial_start)?,
        trial_end: timestamp(sub.trial_end)?,
        created: timestamp(Some(sub.created))?,
    })
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Option<RemoteProduct>> {
        let id: ProductId = parse_id("product", product_id)?;
        match Product::retrieve(self.inner(), &id, &[]).await {
            Ok(product) => Ok(Some(map_product(product))),
            Err(e) if is_not_found(&e) => {
                tracing::warn!(product_id = %product_id, "Stored Stripe product no longer exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_product_by_plan_id(&self, plan_id: &str) -> BillingResult<Option<RemoteProduct>> {
        let products = self.list_products().await?;
        let mut matches: Vec<RemoteProduct> = products
            .into_iter()
            .filter(|p| p.plan_id() == Some(plan_id))
            .collect();

        if matches.len() > 1 {
            tracing::warn!(
                plan_id = %plan_id,
                count = matches.len(),
                "Multiple Stripe products tagged with the same plan_id, preferring an active one"
            );
        }
        // Active products first, list order otherwise
        matches.sort_by_key(|p| !p.active);
        Ok(matches.into_iter().next())
    }

    async fn list_products(&self) -> BillingResult<Vec<RemoteProduct>> {
        let client = self.inner();
        let products = collect_pages(
            |starting_after: Option<ProductId>| {
                let params = ListProducts {
                    limit: Some(PAGE_SIZE),
                    starting_after,
                    ..Default::default()
                };
                async move {
                    let page = Product::list(client, &params).await?;
                    Ok::<_, BillingError>((page.data, page.has_more))
                }
            },
            |p: &Product| p.id.clone(),
        )
        .await?;

        Ok(products.into_iter().map(map_product).collect())
    }

    async fn create_product(&self, params: &ProductParams) -> BillingResult<RemoteProduct> {
        let mut form = form([
            ("name", params.name.as_str()),
            ("active", if params.active { "true" } else { "false" }),
        ]);
        if let Some(description) = &params.description {
            form.insert("description".to_string(), description.clone());
        }
        for (key, value) in params.metadata() {
            form.insert(format!("metadata[{}]", key), value);
        }

        let product: Product = self.inner().post_form("/products", &form).await?;

        tracing::info!(
            plan_id = %params.plan_id,
            product_id = %product.id,
            "Created Stripe product"
        );
        Ok(map_product(product))
    }

    async fn update_product(
        &self,
        product_id: &str,
        params: &ProductParams,
    ) -> BillingResult<RemoteProduct> {
        // Empty string clears the description
        let mut form = form([
            ("name", params.name.as_str()),
            ("active", if params.active { "true" } else { "false" }),
            ("description", params.description.as_deref().unwrap_or_default()),
        ]);
        for (key, value) in params.metadata() {
            form.insert(format!("metadata[{}]", key), value);
        }

        let product: Product = self
            .inner()
            .post_form(&format!("/products/{}", product_id), &form)
            .await?;

        tracing::info!(
            plan_id = %params.plan_id,
            product_id = %product.id,
            "Updated Stripe product"
        );
        Ok(map_product(product))
    }

    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<RemotePrice>> {
        let client = self.inner();
        let prices = collect_pages(
            |starting_after: Option<PriceId>| {
                let mut params = ListPrices::default();
                params.product = Some(IdOrCreate::Id(product_id));
                params.limit = Some(PAGE_SIZE);
                params.starting_after = starting_after;
                async move {
                    let page = Price::list(client, &params).await?;
                    Ok::<_, BillingError>((page.data, page.has_more))
                }
            },
            |p: &Price| p.id.clone(),
        )
        .await?;

        Ok(prices.into_iter().map(map_price).collect())
    }

    async fn create_price(&self, params: &PriceParams) -> BillingResult<RemotePrice> {
        let form = form([
            ("product", params.product_id.as_str()),
            ("unit_amount", params.unit_amount.to_string().as_str()),
            ("currency", params.currency.to_lowercase().as_str()),
            ("recurring[interval]", params.interval.as_str()),
            ("lookup_key", params.lookup_key.as_str()),
            ("transfer_lookup_key", "true"),
            ("metadata[plan_id]", params.plan_id.as_str()),
            ("metadata[interval]", params.interval.as_str()),
        ]);

        let price: Price = self.inner().post_form("/prices", &form).await?;

        tracing::info!(
            plan_id = %params.plan_id,
            price_id = %price.id,
            interval = %params.interval,
            unit_amount = params.unit_amount,
            "Created Stripe price"
        );
        Ok(map_price(price))
    }

    async fn create_customer(&self, params: &CustomerParams) -> BillingResult<String> {
        let create = CreateCustomer {
            email: Some(params.email.as_str()),
            name: params.name.as_deref(),
            metadata: Some(params.metadata()),
            ..Default::default()
        };

        let customer = Customer::create(self.inner(), create).await?;

        tracing::info!(
            user_id = %params.user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(customer.id.to_string())
    }

    async fn create_payment_method(&self, token: &str) -> BillingResult<String> {
        let form = form([("type", "card"), ("card[token]", token)]);
        let created: CreatedObject = self.inner().post_form("/payment_methods", &form).await?;
        Ok(created.id)
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<()> {
        let form = form([("customer", customer_id)]);
        let _: CreatedObject = self
            .inner()
            .post_form(&format!("/payment_methods/{}/attach", payment_method_id), &form)
            .await?;
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let form = form([("invoice_settings[default_payment_method]", payment_method_id)]);
        let _: CreatedObject = self
            .inner()
            .post_form(&format!("/customers/{}", customer_id), &form)
            .await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        default_payment_method: Option<&str>,
    ) -> BillingResult<RemoteSubscription> {
        let customer: CustomerId = parse_id("customer", customer_id)?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        if let Some(pm) = default_payment_method {
            params.default_payment_method = Some(pm.into());
        }

        let subscription = Subscription::create(self.inner(), params).await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            price_id = %price_id,
            "Created Stripe subscription"
        );
        map_subscription(subscription)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<RemoteSubscription> {
        let id: SubscriptionId = parse_id("subscription", subscription_id)?;
        match Subscription::retrieve(self.inner(), &id, &[]).await {
            Ok(sub) => map_subscription(sub),
            Err(e) if is_not_found(&e) => Err(BillingError::NotFound(format!(
                "Subscription {}",
                subscription_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<RemoteSubscription>> {
        let customer: CustomerId = parse_id("customer", customer_id)?;
        let client = self.inner();
        // Stripe omits canceled subscriptions unless a status filter asks for them
        let subscriptions = collect_pages(
            |starting_after: Option<SubscriptionId>| {
                let params = ListSubscriptions {
                    customer: Some(customer.clone()),
                    limit: Some(PAGE_SIZE),
                    starting_after,
                    ..Default::default()
                };
                async move {
                    let page = Subscription::list(client, &params).await?;
                    Ok::<_, BillingError>((page.data, page.has_more))
                }
            },
            |s: &Subscription| s.id.clone(),
        )
        .await?;

        subscriptions.into_iter().map(map_subscription).collect()
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer: CustomerId = parse_id("customer", customer_id)?;

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(self.inner(), params).await?;
        Ok(session.url)
    }
}
