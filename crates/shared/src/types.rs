//! Domain records shared by the billing core, the API and the admin CLI

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ValidationError;

/// Identifier of the plan every user starts on. It has no provider product.
pub const FREE_PLAN_ID: &str = "free";

/// Metadata key used to tag provider products with their internal plan id
pub const PLAN_ID_METADATA_KEY: &str = "plan_id";

/// Metadata key used to tag provider customers with the identity-provider subject
pub const USER_ID_METADATA_KEY: &str = "user_id";

// =============================================================================
// Enums
// =============================================================================

/// Billing interval of a recurring price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub const ALL: [BillingInterval; 2] = [BillingInterval::Month, BillingInterval::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Suffix used when building price lookup keys (`pro_monthly`)
    pub fn lookup_suffix(&self) -> &'static str {
        match self {
            Self::Month => "monthly",
            Self::Year => "yearly",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" | "annual" => Ok(Self::Year),
            _ => Err(ValidationError::InvalidInterval(s.to_string())),
        }
    }
}

/// Subscription status, mirroring the provider's vocabulary.
///
/// Anything the provider reports outside the known set lands in `Unknown`
/// and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a provider status string, mapping anything unrecognized to `Unknown`
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" | "cancelled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Statuses under which the subscribed plan's features stay available
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    /// Statuses after which the subscription can never become active again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Plan
// =============================================================================

/// Entitlement limit attached to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntitlementValue {
    Flag(bool),
    Limit(f64),
    Text(String),
}

/// An offering tier. Loaded from the catalog file, enriched with provider ids by sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(alias = "id")]
    pub plan_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub monthly_price: Option<f64>,
    #[serde(default)]
    pub yearly_price: Option<f64>,
    #[serde(default = "default_currency")]
    pub price_currency: String,
    #[serde(default)]
    pub stripe_product_id: Option<String>,
    #[serde(default)]
    pub stripe_monthly_price_id: Option<String>,
    #[serde(default)]
    pub stripe_yearly_price_id: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entitlements: BTreeMap<String, EntitlementValue>,
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "usd".to_string()
}

impl Plan {
    /// Price in major currency units for an interval
    pub fn price_for(&self, interval: BillingInterval) -> Option<f64> {
        match interval {
            BillingInterval::Month => self.monthly_price,
            BillingInterval::Year => self.yearly_price,
        }
    }

    /// Price in minor currency units (cents), only for positive prices
    pub fn unit_amount(&self, interval: BillingInterval) -> Option<i64> {
        self.price_for(interval)
            .filter(|p| p.is_finite() && *p > 0.0)
            .map(|p| (p * 100.0).round() as i64)
    }

    pub fn price_id_for(&self, interval: BillingInterval) -> Option<&str> {
        match interval {
            BillingInterval::Month => self.stripe_monthly_price_id.as_deref(),
            BillingInterval::Year => self.stripe_yearly_price_id.as_deref(),
        }
    }

    pub fn set_price_id(&mut self, interval: BillingInterval, price_id: Option<String>) {
        match interval {
            BillingInterval::Month => self.stripe_monthly_price_id = price_id,
            BillingInterval::Year => self.stripe_yearly_price_id = price_id,
        }
    }

    /// Interval a provider price id belongs to, if it is one of this plan's prices
    pub fn interval_of_price(&self, price_id: &str) -> Option<BillingInterval> {
        BillingInterval::ALL
            .into_iter()
            .find(|interval| self.price_id_for(*interval) == Some(price_id))
    }

    /// Lookup key tagging this plan's price for an interval, e.g. `pro_monthly`
    pub fn lookup_key(&self, interval: BillingInterval) -> String {
        format!("{}_{}", self.plan_id, interval.lookup_suffix())
    }

    /// Intervals that carry a positive price and therefore need a provider price
    pub fn billable_intervals(&self) -> Vec<BillingInterval> {
        BillingInterval::ALL
            .into_iter()
            .filter(|interval| self.unit_amount(*interval).is_some())
            .collect()
    }

    /// Whether the plan needs a provider product at all
    pub fn requires_billing(&self) -> bool {
        !self.billable_intervals().is_empty()
    }

    pub fn is_free(&self) -> bool {
        self.plan_id == FREE_PLAN_ID
    }

    /// Feature list as stored in provider metadata
    pub fn features_metadata(&self) -> String {
        serde_json::to_string(&self.features).unwrap_or_else(|_| "[]".to_string())
    }

    /// Check a single definition
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.plan_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                plan_id: self.plan_id.clone(),
                field: "planId",
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                plan_id: self.plan_id.clone(),
                field: "name",
            });
        }

        for interval in BillingInterval::ALL {
            if let Some(price) = self.price_for(interval) {
                if !price.is_finite() || price < 0.0 {
                    return Err(ValidationError::InvalidPrice {
                        plan_id: self.plan_id.clone(),
                        interval,
                        price,
                    });
                }
            }
        }

        let currency_ok =
            self.price_currency.len() == 3 && self.price_currency.chars().all(|c| c.is_ascii_alphabetic());
        if !currency_ok {
            return Err(ValidationError::InvalidCurrency {
                plan_id: self.plan_id.clone(),
                currency: self.price_currency.clone(),
            });
        }

        if self.is_free() && self.requires_billing() {
            return Err(ValidationError::PricedFreePlan);
        }
        if !self.is_free() && self.monthly_price.is_none() && self.yearly_price.is_none() {
            return Err(ValidationError::MissingField {
                plan_id: self.plan_id.clone(),
                field: "monthlyPrice or yearlyPrice",
            });
        }

        Ok(())
    }
}

/// Validate a whole catalog: every plan on its own plus global uniqueness of ids
pub fn validate_catalog(plans: &[Plan]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for plan in plans {
        plan.validate()?;
        if !seen.insert(plan.plan_id.as_str()) {
            return Err(ValidationError::DuplicatePlanId(plan.plan_id.clone()));
        }
    }
    Ok(())
}

// =============================================================================
// Users
// =============================================================================

/// One per identity-provider user. The customer id is assigned once and never replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub stripe_customer_id: String,
    pub display_name: Option<String>,
    pub email: String,
}

/// Reconciled read model of a user's billing state, keyed by `user_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSubscription {
    pub user_id: String,
    pub plan_id: String,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub billing_interval: Option<BillingInterval>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
}

impl UserSubscription {
    /// Synthetic free-plan record: active, no provider subscription, never expires
    pub fn free(user_id: impl Into<String>, stripe_customer_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan_id: FREE_PLAN_ID.to_string(),
            stripe_customer_id: stripe_customer_id.into(),
            stripe_subscription_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            billing_interval: None,
            trial_start: None,
            trial_end: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.stripe_subscription_id.is_none() && self.plan_id == FREE_PLAN_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pro() -> Plan {
        serde_json::from_value(serde_json::json!({
            "id": "pro",
            "name": "Pro",
            "monthlyPrice": 19.99,
            "yearlyPrice": 199.0,
            "features": ["Unlimited projects", "Priority support"],
            "entitlements": { "seats": 5, "sso": false, "tier": "gold" }
        }))
        .unwrap()
    }

    #[test]
    fn test_plan_defaults_and_alias() {
        let plan = pro();
        assert_eq!(plan.plan_id, "pro");
        assert!(plan.is_active);
        assert_eq!(plan.price_currency, "usd");
        assert!(plan.stripe_product_id.is_none());
        assert_eq!(plan.entitlements["seats"], EntitlementValue::Limit(5.0));
        assert_eq!(plan.entitlements["sso"], EntitlementValue::Flag(false));
        assert_eq!(plan.entitlements["tier"], EntitlementValue::Text("gold".into()));
    }

    #[test]
    fn test_plan_serializes_camel_case() {
        let value = serde_json::to_value(pro()).unwrap();
        assert_eq!(value["planId"], "pro");
        assert_eq!(value["monthlyPrice"], 19.99);
        assert!(value["stripeMonthlyPriceId"].is_null());
    }

    #[test]
    fn test_unit_amount_rounds_to_cents() {
        let plan = pro();
        assert_eq!(plan.unit_amount(BillingInterval::Month), Some(1999));
        assert_eq!(plan.unit_amount(BillingInterval::Year), Some(19900));
        assert_eq!(plan.lookup_key(BillingInterval::Year), "pro_yearly");
    }

    #[test]
    fn test_free_plan_requires_no_billing() {
        let free: Plan =
            serde_json::from_value(serde_json::json!({ "planId": "free", "name": "Free", "monthlyPrice": 0 }))
                .unwrap();
        assert!(!free.requires_billing());
        assert!(free.billable_intervals().is_empty());
        assert!(free.validate().is_ok());
    }

    #[test]
    fn test_interval_of_price() {
        let mut plan = pro();
        plan.stripe_monthly_price_id = Some("price_abc".into());
        plan.stripe_yearly_price_id = Some("price_def".into());
        assert_eq!(plan.interval_of_price("price_abc"), Some(BillingInterval::Month));
        assert_eq!(plan.interval_of_price("price_def"), Some(BillingInterval::Year));
        assert_eq!(plan.interval_of_price("price_zzz"), None);
    }

    #[test]
    fn test_validate_catalog_rejects_bad_definitions() {
        let mut negative = pro();
        negative.monthly_price = Some(-1.0);
        assert!(matches!(
            validate_catalog(&[negative]),
            Err(ValidationError::InvalidPrice { .. })
        ));

        let mut unpriced = pro();
        unpriced.monthly_price = None;
        unpriced.yearly_price = None;
        assert!(matches!(
            validate_catalog(&[unpriced]),
            Err(ValidationError::MissingField { .. })
        ));

        let mut bad_currency = pro();
        bad_currency.price_currency = "dollars".into();
        assert!(matches!(
            validate_catalog(&[bad_currency]),
            Err(ValidationError::InvalidCurrency { .. })
        ));

        assert!(matches!(
            validate_catalog(&[pro(), pro()]),
            Err(ValidationError::DuplicatePlanId(id)) if id == "pro"
        ));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(SubscriptionStatus::from_str_lossy("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(SubscriptionStatus::from_str_lossy("paused"), SubscriptionStatus::Paused);
        assert_eq!(SubscriptionStatus::from_str_lossy("on_hold"), SubscriptionStatus::Unknown);

        let parsed: SubscriptionStatus = serde_json::from_str("\"incomplete_expired\"").unwrap();
        assert_eq!(parsed, SubscriptionStatus::IncompleteExpired);
        let unknown: SubscriptionStatus = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(unknown, SubscriptionStatus::Unknown);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("month".parse::<BillingInterval>().unwrap(), BillingInterval::Month);
        assert_eq!("Yearly".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
        assert!("weekly".parse::<BillingInterval>().is_err());
    }

    #[test]
    fn test_free_subscription_shape() {
        let sub = UserSubscription::free("user-1", "cus_123");
        assert_eq!(sub.plan_id, "free");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.stripe_subscription_id.is_none());
        assert!(sub.current_period_end.is_none());
        assert!(!sub.cancel_at_period_end);
        assert!(sub.is_free());
    }
}
