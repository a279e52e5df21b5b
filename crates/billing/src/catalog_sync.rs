//! Catalog synchronization against the billing provider
//!
//! Reconciles plan definitions with provider products and prices:
//!
//! - products are located by the stored product id first, then by `plan_id` metadata
//! - product fields are only written when they changed
//! - prices are append-only; a changed amount produces a new price carrying the
//!   plan's lookup key, the old price stays untouched for existing subscribers
//! - resolved ids are persisted per plan, a freshly created product id immediately
//!
//! A failing plan is recorded in the report and the remaining plans are still synced.

use std::sync::Arc;

use saaskit_shared::{validate_catalog, BillingInterval, Plan, FREE_PLAN_ID};
use serde::Serialize;

use crate::error::BillingResult;
use crate::provider::{BillingProvider, PriceParams, ProductParams, RemotePrice, RemoteProduct};
use crate::store::BillingStore;

/// A plan that failed to sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub plan_id: String,
    pub message: String,
}

/// Rolled-up result of a catalog sync
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Plans whose product was created
    pub created: Vec<String>,
    /// Plans whose product was updated or that received a new price
    pub updated: Vec<String>,
    /// Plans that needed no provider writes
    pub skipped: Vec<String>,
    pub errors: Vec<SyncError>,
    /// Every plan in input order, carrying whatever provider ids were resolved
    #[serde(skip)]
    pub plans: Vec<Plan>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanOutcome {
    Created,
    Updated,
    Skipped,
}

/// Synchronizes plan definitions with provider products and prices
#[derive(Clone)]
pub struct CatalogSynchronizer {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

impl CatalogSynchronizer {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        Self { provider, store }
    }

    /// Sync every plan definition.
    ///
    /// Definitions are validated up front; a validation failure aborts before any
    /// provider call. After that, per-plan failures land in the report.
    pub async fn sync(&self, plans: Vec<Plan>) -> BillingResult<SyncReport> {
        validate_catalog(&plans)?;

        let mut report = SyncReport::default();
        for (position, mut plan) in plans.into_iter().enumerate() {
            let plan_id = plan.plan_id.clone();
            match self.sync_plan(&mut plan, position as i32).await {
                Ok(PlanOutcome::Created) => report.created.push(plan_id),
                Ok(PlanOutcome::Updated) => report.updated.push(plan_id),
                Ok(PlanOutcome::Skipped) => report.skipped.push(plan_id),
                Err(e) => {
                    tracing::error!(plan_id = %plan_id, error = %e, "Failed to sync plan");
                    report.errors.push(SyncError {
                        plan_id,
                        message: e.to_string(),
                    });
                }
            }
            report.plans.push(plan);
        }

        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Catalog sync finished"
        );

        Ok(report)
    }

    async fn sync_plan(&self, plan: &mut Plan, position: i32) -> BillingResult<PlanOutcome> {
        if !plan.requires_billing() {
            tracing::debug!(plan_id = %plan.plan_id, "Plan requires no billing, storing locally");
            self.store.upsert_plan(plan, position).await?;
            return Ok(PlanOutcome::Skipped);
        }

        let params = ProductParams::from_plan(plan);
        let mut outcome = PlanOutcome::Skipped;

        let product = match self.locate_product(plan).await? {
            Some(product) => {
                if product.differs_from(&params) {
                    let updated = self.provider.update_product(&product.id, &params).await?;
                    outcome = PlanOutcome::Updated;
                    updated
                } else {
                    product
                }
            }
            None => {
                let created = self.provider.create_product(&params).await?;
                // Persist right away so a later failure can't orphan the product
                plan.stripe_product_id = Some(created.id.clone());
                self.store.upsert_plan(plan, position).await?;
                outcome = PlanOutcome::Created;
                created
            }
        };
        plan.stripe_product_id = Some(product.id.clone());

        let existing_prices = self.provider.list_prices(&product.id).await?;
        for interval in plan.billable_intervals() {
            let Some(price_params) = PriceParams::for_plan(plan, &product.id, interval) else {
                continue;
            };

            let price_id = match find_reusable_price(plan, interval, &price_params, &existing_prices) {
                Some(price) => price.id.clone(),
                None => {
                    if let Some(previous) = plan.price_id_for(interval) {
                        tracing::info!(
                            plan_id = %plan.plan_id,
                            interval = %interval,
                            previous_price_id = %previous,
                            "Price changed, creating a new price"
                        );
                    }
                    let created = self.provider.create_price(&price_params).await?;
                    if outcome == PlanOutcome::Skipped {
                        outcome = PlanOutcome::Updated;
                    }
                    created.id
                }
            };
            plan.set_price_id(interval, Some(price_id));
        }

        self.store.upsert_plan(plan, position).await?;

        tracing::info!(
            plan_id = %plan.plan_id,
            product_id = ?plan.stripe_product_id,
            monthly_price_id = ?plan.stripe_monthly_price_id,
            yearly_price_id = ?plan.stripe_yearly_price_id,
            outcome = ?outcome,
            "Synced plan"
        );

        Ok(outcome)
    }

    /// Stored product id first; metadata search only as recovery
    async fn locate_product(&self, plan: &Plan) -> BillingResult<Option<RemoteProduct>> {
        if let Some(product_id) = plan.stripe_product_id.as_deref() {
            if let Some(product) = self.provider.retrieve_product(product_id).await? {
                return Ok(Some(product));
            }
            tracing::warn!(
                plan_id = %plan.plan_id,
                product_id = %product_id,
                "Stored product id not found, falling back to metadata search"
            );
        }

        let found = self.provider.find_product_by_plan_id(&plan.plan_id).await?;
        if let Some(product) = &found {
            tracing::info!(
                plan_id = %plan.plan_id,
                product_id = %product.id,
                "Recovered product from plan_id metadata"
            );
        }
        Ok(found)
    }

    /// Rebuild plan records from provider products tagged with `plan_id` metadata.
    ///
    /// Existing local plans keep their entitlements and position. A default free
    /// plan is added when the catalog has none, since it has no provider product.
    pub async fn backfill_from_provider(&self) -> BillingResult<Vec<Plan>> {
        let existing = self.store.list_plans().await?;
        let mut next_position = existing.len() as i32;
        let mut backfilled = Vec::new();

        for product in self.provider.list_products().await? {
            let Some(plan_id) = product.plan_id().map(str::to_string) else {
                continue;
            };
            let prices = self.provider.list_prices(&product.id).await?;
            let local_position = existing.iter().position(|p| p.plan_id == plan_id);
            let base = local_position.map(|i| existing[i].clone());

            let mut plan = base.unwrap_or_else(|| Plan {
                plan_id: plan_id.clone(),
                name: product.name.clone(),
                description: None,
                is_active: product.active,
                monthly_price: None,
                yearly_price: None,
                price_currency: "usd".to_string(),
                stripe_product_id: None,
                stripe_monthly_price_id: None,
                stripe_yearly_price_id: None,
                features: Vec::new(),
                entitlements: Default::default(),
            });
            plan.name = product.name.clone();
            plan.description = product.description.clone().filter(|d| !d.is_empty());
            plan.is_active = product.active;
            plan.stripe_product_id = Some(product.id.clone());
            if let Some(features) = product
                .features_metadata()
                .and_then(|f| serde_json::from_str::<Vec<String>>(f).ok())
            {
                plan.features = features;
            }

            for interval in BillingInterval::ALL {
                if let Some(price) = pick_backfill_price(&plan, interval, &prices) {
                    plan.set_price_id(interval, Some(price.id.clone()));
                    let amount = price.unit_amount.map(|cents| cents as f64 / 100.0);
                    match interval {
                        BillingInterval::Month => plan.monthly_price = amount,
                        BillingInterval::Year => plan.yearly_price = amount,
                    }
                    if !price.currency.is_empty() {
                        plan.price_currency = price.currency.to_lowercase();
                    }
                }
            }

            let position = match local_position {
                Some(i) => i as i32,
                None => {
                    next_position += 1;
                    next_position
                }
            };
            self.store.upsert_plan(&plan, position).await?;
            tracing::info!(plan_id = %plan.plan_id, product_id = %product.id, "Backfilled plan from provider");
            backfilled.push(plan);
        }

        if self.store.get_plan(FREE_PLAN_ID).await?.is_none() {
            let free = Plan {
                plan_id: FREE_PLAN_ID.to_string(),
                name: "Free".to_string(),
                description: None,
                is_active: true,
                monthly_price: None,
                yearly_price: None,
                price_currency: "usd".to_string(),
                stripe_product_id: None,
                stripe_monthly_price_id: None,
                stripe_yearly_price_id: None,
                features: Vec::new(),
                entitlements: Default::default(),
            };
            self.store.upsert_plan(&free, -1).await?;
            tracing::info!("Added default free plan to the catalog");
            backfilled.insert(0, free);
        }

        Ok(backfilled)
    }
}

/// An existing price that already serves this plan interval unchanged
fn find_reusable_price<'a>(
    plan: &Plan,
    interval: BillingInterval,
    params: &PriceParams,
    prices: &'a [RemotePrice],
) -> Option<&'a RemotePrice> {
    prices
        .iter()
        .filter(|p| p.matches(params))
        .find(|p| p.lookup_key.as_deref() == Some(params.lookup_key.as_str()))
        .or_else(|| {
            // Lookup key lost, but the stored id still points at a matching price
            let stored = plan.price_id_for(interval)?;
            prices.iter().find(|p| p.id == stored && p.matches(params))
        })
}

fn pick_backfill_price<'a>(
    plan: &Plan,
    interval: BillingInterval,
    prices: &'a [RemotePrice],
) -> Option<&'a RemotePrice> {
    let lookup_key = plan.lookup_key(interval);
    let candidates = || {
        prices
            .iter()
            .filter(move |p| p.active && p.interval == Some(interval))
    };
    candidates()
        .find(|p| p.lookup_key.as_deref() == Some(lookup_key.as_str()))
        .or_else(|| candidates().last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBillingStore, MockBillingProvider};
    use saaskit_shared::ValidationError;

    fn plans() -> Vec<Plan> {
        serde_json::from_value(serde_json::json!([
            { "planId": "free", "name": "Free", "features": ["1 project"] },
            { "planId": "pro", "name": "Pro", "description": "For professionals",
              "monthlyPrice": 19, "yearlyPrice": 190, "features": ["Unlimited projects"] },
            { "planId": "team", "name": "Team", "monthlyPrice": 49, "features": ["SSO"] }
        ]))
        .unwrap()
    }

    fn setup() -> (Arc<MockBillingProvider>, Arc<InMemoryBillingStore>, CatalogSynchronizer) {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let sync = CatalogSynchronizer::new(provider.clone(), store.clone());
        (provider, store, sync)
    }

    #[tokio::test]
    async fn test_first_sync_creates_products_and_prices() {
        let (provider, store, sync) = setup();

        let report = sync.sync(plans()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.created, vec!["pro", "team"]);
        assert_eq!(report.skipped, vec!["free"]);
        assert_eq!(provider.products_created(), 2);
        assert_eq!(provider.prices_created(), 3);

        let pro = store.get_plan("pro").await.unwrap().unwrap();
        assert!(pro.stripe_product_id.is_some());
        assert!(pro.stripe_monthly_price_id.is_some());
        assert!(pro.stripe_yearly_price_id.is_some());

        let free = store.get_plan("free").await.unwrap().unwrap();
        assert!(free.stripe_product_id.is_none());

        let monthly = provider
            .price(pro.stripe_monthly_price_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(monthly.unit_amount, Some(1900));
        assert_eq!(monthly.lookup_key.as_deref(), Some("pro_monthly"));
    }

    #[tokio::test]
    async fn test_second_sync_is_idempotent() {
        let (provider, _store, sync) = setup();

        let first = sync.sync(plans()).await.unwrap();
        let second = sync.sync(first.plans.clone()).await.unwrap();

        assert!(second.created.is_empty());
        assert!(second.updated.is_empty());
        assert_eq!(second.skipped, vec!["free", "pro", "team"]);
        assert_eq!(provider.products_created(), 2);
        assert_eq!(provider.products_updated(), 0);
        assert_eq!(provider.prices_created(), 3);
        assert_eq!(first.plans, second.plans);
    }

    #[tokio::test]
    async fn test_stripped_metadata_is_retagged_without_duplicate() {
        let (provider, _store, sync) = setup();

        let first = sync.sync(plans()).await.unwrap();
        let pro_product = first.plans[1].stripe_product_id.clone().unwrap();
        provider.strip_metadata(&pro_product).await;

        let second = sync.sync(first.plans.clone()).await.unwrap();

        assert!(second.created.is_empty());
        assert_eq!(second.updated, vec!["pro"]);
        assert_eq!(provider.products_created(), 2);
        assert_eq!(provider.products().await.len(), 2);
        assert_eq!(provider.prices().await.len(), 3);

        let retagged = provider
            .products()
            .await
            .into_iter()
            .find(|p| p.id == pro_product)
            .unwrap();
        assert_eq!(retagged.plan_id(), Some("pro"));
        assert_eq!(second.plans[1].stripe_product_id.as_deref(), Some(pro_product.as_str()));
    }

    #[tokio::test]
    async fn test_resync_without_stored_ids_recovers_from_metadata() {
        let (provider, _store, sync) = setup();

        sync.sync(plans()).await.unwrap();
        // Definition file never got the ids written back
        let report = sync.sync(plans()).await.unwrap();

        assert!(report.created.is_empty());
        assert_eq!(provider.products_created(), 2);
        assert_eq!(provider.prices_created(), 3);
        assert_eq!(provider.products().await.len(), 2);
    }

    #[tokio::test]
    async fn test_changed_name_updates_product_only() {
        let (provider, _store, sync) = setup();
        let first = sync.sync(plans()).await.unwrap();

        let mut changed = first.plans.clone();
        changed[1].name = "Pro Plus".to_string();
        let report = sync.sync(changed).await.unwrap();

        assert_eq!(report.updated, vec!["pro"]);
        assert_eq!(provider.products_updated(), 1);
        assert_eq!(provider.prices_created(), 3);
        let products = provider.products().await;
        assert!(products.iter().any(|p| p.name == "Pro Plus"));
    }

    #[tokio::test]
    async fn test_changed_price_creates_new_price_and_keeps_old() {
        let (provider, store, sync) = setup();
        let first = sync.sync(plans()).await.unwrap();
        let old_price_id = first.plans[1].stripe_monthly_price_id.clone().unwrap();

        let mut changed = first.plans.clone();
        changed[1].monthly_price = Some(24.0);
        let report = sync.sync(changed).await.unwrap();

        assert_eq!(report.updated, vec!["pro"]);
        assert_eq!(provider.prices_created(), 4);
        assert_eq!(provider.products_updated(), 0);

        let pro = store.get_plan("pro").await.unwrap().unwrap();
        let new_price_id = pro.stripe_monthly_price_id.clone().unwrap();
        assert_ne!(new_price_id, old_price_id);

        let old_price = provider.price(&old_price_id).await.unwrap();
        assert_eq!(old_price.unit_amount, Some(1900));
        assert!(old_price.active);
        let new_price = provider.price(&new_price_id).await.unwrap();
        assert_eq!(new_price.unit_amount, Some(2400));
        assert_eq!(new_price.lookup_key.as_deref(), Some("pro_monthly"));
        // Yearly price is untouched
        assert_eq!(pro.stripe_yearly_price_id, first.plans[1].stripe_yearly_price_id);
    }

    #[tokio::test]
    async fn test_failing_plan_does_not_block_others() {
        let (provider, store, sync) = setup();
        provider.fail_plan("pro").await;

        let report = sync.sync(plans()).await.unwrap();

        assert!(!report.is_success());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].plan_id, "pro");
        assert_eq!(report.created, vec!["team"]);
        assert_eq!(report.skipped, vec!["free"]);
        assert!(store.get_plan("team").await.unwrap().is_some());
        assert_eq!(report.plans.len(), 3);
    }

    #[tokio::test]
    async fn test_validation_error_aborts_before_provider_calls() {
        let (provider, _store, sync) = setup();
        let mut bad = plans();
        bad.push(bad[1].clone());

        let result = sync.sync(bad).await;

        assert!(matches!(
            result,
            Err(crate::BillingError::Validation(ValidationError::DuplicatePlanId(_)))
        ));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_product_id_falls_back_to_metadata() {
        let (provider, _store, sync) = setup();
        let first = sync.sync(plans()).await.unwrap();

        let mut stale = first.plans.clone();
        stale[1].stripe_product_id = Some("prod_deleted".to_string());
        let report = sync.sync(stale).await.unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.plans[1].stripe_product_id, first.plans[1].stripe_product_id);
        assert_eq!(provider.products_created(), 2);
    }

    #[tokio::test]
    async fn test_backfill_rebuilds_catalog_from_provider() {
        let (provider, _, sync) = setup();
        sync.sync(plans()).await.unwrap();

        // Fresh store, same provider
        let store = Arc::new(InMemoryBillingStore::new());
        let backfill = CatalogSynchronizer::new(provider.clone(), store.clone());
        let plans = backfill.backfill_from_provider().await.unwrap();

        assert_eq!(plans.len(), 3);
        let pro = store.get_plan("pro").await.unwrap().unwrap();
        assert_eq!(pro.monthly_price, Some(19.0));
        assert_eq!(pro.yearly_price, Some(190.0));
        assert_eq!(pro.features, vec!["Unlimited projects"]);
        assert!(pro.stripe_monthly_price_id.is_some());
        assert!(store.get_plan(FREE_PLAN_ID).await.unwrap().is_some());
    }
}
