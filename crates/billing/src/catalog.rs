//! Plan catalog: resolver over persisted plans and the catalog definition file

use std::path::Path;
use std::sync::Arc;

use saaskit_shared::{validate_catalog, Plan, ValidationError, FREE_PLAN_ID};

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Read-only lookups over the persisted plan catalog
#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// All plans, in catalog file order
    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans().await
    }

    /// Plans offered to users
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans = self.store.list_plans().await?;
        Ok(plans.into_iter().filter(|p| p.is_active).collect())
    }

    pub async fn get_plan_by_id(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        self.store.get_plan(plan_id).await
    }

    /// Plan owning a provider price id, matching monthly and yearly prices
    pub async fn get_plan_by_price_id(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        let plans = self.store.list_plans().await?;
        Ok(plans
            .into_iter()
            .find(|p| p.interval_of_price(price_id).is_some()))
    }

    /// The free plan. Its absence means the catalog was never loaded.
    pub async fn get_free_plan(&self) -> BillingResult<Plan> {
        self.store.get_plan(FREE_PLAN_ID).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Plan '{}' is missing from the catalog; run catalog sync first",
                FREE_PLAN_ID
            ))
        })
    }
}

/// The JSON catalog definition file: an array of plan objects
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogFile {
    pub plans: Vec<Plan>,
}

impl CatalogFile {
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let plans: Vec<Plan> =
            serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Ok(Self { plans })
    }

    /// Read and parse the file. Validation is a separate step.
    pub fn load(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("Failed to read catalog {}: {}", path.display(), e))
        })?;
        Ok(Self::from_json(&json)?)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_catalog(&self.plans)
    }

    pub fn to_json(&self) -> BillingResult<String> {
        let mut json = serde_json::to_string_pretty(&self.plans)?;
        json.push('\n');
        Ok(json)
    }

    /// Rewrite the file in place, keeping plan order
    pub fn save(&self, path: impl AsRef<Path>) -> BillingResult<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| {
            BillingError::Config(format!("Failed to write catalog {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), plans = self.plans.len(), "Wrote plan catalog");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBillingStore;

    const CATALOG: &str = r#"[
        { "planId": "free", "name": "Free", "features": ["1 project"] },
        { "planId": "pro", "name": "Pro", "monthlyPrice": 19, "yearlyPrice": 190,
          "stripeProductId": "prod_pro",
          "stripeMonthlyPriceId": "price_abc", "stripeYearlyPriceId": "price_def" },
        { "planId": "legacy", "name": "Legacy", "isActive": false, "monthlyPrice": 5 }
    ]"#;

    async fn catalog() -> PlanCatalog {
        let store = Arc::new(InMemoryBillingStore::new());
        let file = CatalogFile::from_json(CATALOG).unwrap();
        for (position, plan) in file.plans.iter().enumerate() {
            store.upsert_plan(plan, position as i32).await.unwrap();
        }
        PlanCatalog::new(store)
    }

    #[tokio::test]
    async fn test_get_plan_by_price_id_matches_both_intervals() {
        let catalog = catalog().await;

        let monthly = catalog.get_plan_by_price_id("price_abc").await.unwrap();
        let yearly = catalog.get_plan_by_price_id("price_def").await.unwrap();
        assert_eq!(monthly.unwrap().plan_id, "pro");
        assert_eq!(yearly.unwrap().plan_id, "pro");
        assert!(catalog.get_plan_by_price_id("price_unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_free_plan_resolvable_without_provider_ids() {
        let catalog = catalog().await;
        let free = catalog.get_free_plan().await.unwrap();
        assert_eq!(free.plan_id, "free");
        assert!(free.stripe_product_id.is_none());
    }

    #[tokio::test]
    async fn test_free_plan_missing_is_not_found() {
        let catalog = PlanCatalog::new(Arc::new(InMemoryBillingStore::new()));
        assert!(matches!(catalog.get_free_plan().await, Err(BillingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_plans_keeps_configuration_order() {
        let catalog = catalog().await;
        let ids: Vec<String> = catalog
            .list_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.plan_id)
            .collect();
        assert_eq!(ids, vec!["free", "pro", "legacy"]);

        let active = catalog.list_active_plans().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(catalog.get_plan_by_id("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_catalog_file_round_trips_provider_ids() {
        let file = CatalogFile::from_json(CATALOG).unwrap();
        file.validate().unwrap();

        let rewritten = CatalogFile::from_json(&file.to_json().unwrap()).unwrap();
        assert_eq!(rewritten, file);
        assert!(file.to_json().unwrap().contains("\"stripeMonthlyPriceId\": \"price_abc\""));
    }

    #[test]
    fn test_malformed_catalog_is_validation_error() {
        assert!(matches!(
            CatalogFile::from_json("{ \"planId\": \"pro\" }"),
            Err(ValidationError::Malformed(_))
        ));
    }
}
