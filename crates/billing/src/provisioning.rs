//! Demo and test user provisioning
//!
//! Creates identity accounts with billing state for non-production
//! environments. Each user is provisioned independently; a failure is recorded
//! in the [`BatchReport`] and the batch moves on to the next user.

use std::path::Path;
use std::sync::Arc;

use saaskit_shared::{BillingInterval, SubscriptionStatus, ValidationError, FREE_PLAN_ID};
use serde::{Deserialize, Serialize};

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::identity::{IdentityError, IdentityProvider};
use crate::provider::BillingProvider;
use crate::store::BillingStore;
use crate::subscriptions::{ReconcileOutcome, SubscriptionReconciler};

// =============================================================================
// Seed file
// =============================================================================

/// One user entry of a seed file
#[derive(Debug, Clone, PartialEq)]
pub struct SeedUser {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub group: Option<String>,
    pub plan_id: String,
    pub interval: BillingInterval,
    /// Test payment token (e.g. `tok_visa`) for paid plans
    pub payment_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSeedUser {
    email: String,
    password: String,
    name: Option<String>,
    group: Option<String>,
    plan_id: Option<String>,
    interval: Option<String>,
    payment_token: Option<String>,
}

impl TryFrom<RawSeedUser> for SeedUser {
    type Error = ValidationError;

    fn try_from(raw: RawSeedUser) -> Result<Self, Self::Error> {
        if raw.email.trim().is_empty() {
            return Err(ValidationError::Malformed("seed user without email".to_string()));
        }
        let interval = match raw.interval.as_deref() {
            Some(value) => value.parse()?,
            None => BillingInterval::Month,
        };
        Ok(Self {
            email: raw.email,
            password: raw.password,
            name: raw.name,
            group: raw.group,
            plan_id: raw.plan_id.unwrap_or_else(|| FREE_PLAN_ID.to_string()),
            interval,
            payment_token: raw.payment_token.filter(|t| !t.is_empty()),
        })
    }
}

/// Parse a seed file body: a JSON array of user entries
pub fn parse_seed_users(json: &str) -> Result<Vec<SeedUser>, ValidationError> {
    let raw: Vec<RawSeedUser> =
        serde_json::from_str(json).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    raw.into_iter().map(SeedUser::try_from).collect()
}

pub fn load_seed_users(path: impl AsRef<Path>) -> BillingResult<Vec<SeedUser>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|e| {
        BillingError::Config(format!("Failed to read seed file {}: {}", path.display(), e))
    })?;
    Ok(parse_seed_users(&json)?)
}

// =============================================================================
// Report
// =============================================================================

/// A successfully provisioned user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedUser {
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    /// The account existed already and was signed into instead
    pub existing_account: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum SeedOutcome {
    Provisioned(ProvisionedUser),
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedResult {
    pub email: String,
    #[serde(flatten)]
    pub outcome: SeedOutcome,
}

/// Per-user results of a provisioning run, in input order
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub results: Vec<SeedResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, SeedOutcome::Provisioned(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

// =============================================================================
// Workflow
// =============================================================================

pub struct ProvisioningWorkflow {
    identity: Arc<dyn IdentityProvider>,
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    customers: CustomerService,
    reconciler: SubscriptionReconciler,
}

impl ProvisioningWorkflow {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        Self {
            customers: CustomerService::new(provider.clone(), store.clone()),
            reconciler: SubscriptionReconciler::new(provider.clone(), store.clone()),
            identity,
            provider,
            store,
        }
    }

    /// Provision every user, continuing past failures
    pub async fn run(&self, users: &[SeedUser]) -> BatchReport {
        let mut report = BatchReport::default();

        for user in users {
            let outcome = match self.provision_user(user).await {
                Ok(provisioned) => SeedOutcome::Provisioned(provisioned),
                Err(e) => {
                    tracing::error!(email = %user.email, error = %e, "Failed to provision user");
                    SeedOutcome::Failed {
                        message: e.to_string(),
                    }
                }
            };
            report.results.push(SeedResult {
                email: user.email.clone(),
                outcome,
            });
        }

        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Provisioning finished"
        );
        report
    }

    /// Provision a single user. Re-running for an already provisioned user is safe.
    pub async fn provision_user(&self, user: &SeedUser) -> BillingResult<ProvisionedUser> {
        let existing_account = match self
            .identity
            .sign_up(&user.email, &user.password, user.name.as_deref())
            .await
        {
            Ok(_) => false,
            Err(IdentityError::AlreadyExists(_)) => {
                tracing::info!(email = %user.email, "Account already exists, signing in");
                true
            }
            Err(e) => return Err(e.into()),
        };

        let session = self.identity.sign_in(&user.email, &user.password).await?;
        let user_id = session.user.id.clone();

        let result = self.provision_billing(user, &user_id).await;

        if let Err(e) = self.identity.sign_out(&session).await {
            tracing::warn!(user_id = %user_id, error = %e, "Sign-out failed");
        }

        let (plan_id, status) = result?;
        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            status = %status,
            "Provisioned user"
        );

        Ok(ProvisionedUser {
            user_id,
            plan_id,
            status,
            existing_account,
        })
    }

    async fn provision_billing(
        &self,
        user: &SeedUser,
        user_id: &str,
    ) -> BillingResult<(String, SubscriptionStatus)> {
        if let Some(group) = user.group.as_deref() {
            self.identity.add_to_group(user_id, group).await?;
        }

        let registration = self
            .customers
            .register_user(user_id, &user.email, user.name.as_deref())
            .await?;
        let profile = registration.profile;

        let plan = self
            .reconciler
            .catalog()
            .get_plan_by_id(&user.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", user.plan_id)))?;

        if !plan.requires_billing() {
            let record = self.reconciler.write_free_plan(&profile).await?;
            return Ok((record.plan_id, record.status));
        }

        if let Some(current) = self.store.get_subscription(user_id).await? {
            if current.plan_id == plan.plan_id
                && current.stripe_subscription_id.is_some()
                && current.status.grants_access()
            {
                tracing::info!(user_id = %user_id, plan_id = %plan.plan_id, "Already subscribed");
                return Ok((current.plan_id, current.status));
            }
        }

        let price_id = plan.price_id_for(user.interval).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Plan {} has no {} price (run catalog sync first)",
                plan.plan_id, user.interval
            ))
        })?;

        let customer_id = profile.stripe_customer_id.as_str();
        let payment_method = match user.payment_token.as_deref() {
            // Attach and make default before subscribing, or the subscription starts incomplete
            Some(token) => {
                let pm = self.provider.create_payment_method(token).await?;
                self.provider.attach_payment_method(&pm, customer_id).await?;
                self.provider.set_default_payment_method(customer_id, &pm).await?;
                Some(pm)
            }
            None => None,
        };

        let remote = self
            .provider
            .create_subscription(customer_id, price_id, payment_method.as_deref())
            .await?;

        match self.reconciler.reconcile(&remote).await? {
            ReconcileOutcome::Applied(record) => Ok((record.plan_id, record.status)),
            ReconcileOutcome::Skipped(reason) => Err(BillingError::InvalidInput(format!(
                "Subscription {} was not recorded: {}",
                remote.id, reason
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_sync::CatalogSynchronizer;
    use crate::identity::{IdentitySession, IdentityUser};
    use crate::memory::{InMemoryBillingStore, MockBillingProvider};
    use async_trait::async_trait;
    use saaskit_shared::Plan;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeIdentity {
        accounts: Mutex<HashMap<String, String>>,
        rejected: HashSet<String>,
        sign_outs: Mutex<usize>,
    }

    impl FakeIdentity {
        fn rejecting(email: &str) -> Self {
            Self {
                rejected: [email.to_string()].into_iter().collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeIdentity {
        async fn sign_up(
            &self,
            email: &str,
            _password: &str,
            _name: Option<&str>,
        ) -> Result<IdentityUser, IdentityError> {
            if self.rejected.contains(email) {
                return Err(IdentityError::Rejected {
                    status: 400,
                    message: "Unable to validate email address".into(),
                });
            }
            let mut accounts = self.accounts.lock().await;
            if accounts.contains_key(email) {
                return Err(IdentityError::AlreadyExists(email.into()));
            }
            let id = format!("user-{}", accounts.len() + 1);
            accounts.insert(email.into(), id.clone());
            Ok(IdentityUser {
                id,
                email: Some(email.into()),
            })
        }

        async fn sign_in(&self, email: &str, _password: &str) -> Result<IdentitySession, IdentityError> {
            let accounts = self.accounts.lock().await;
            let id = accounts.get(email).cloned().ok_or(IdentityError::Rejected {
                status: 400,
                message: "Invalid login credentials".into(),
            })?;
            Ok(IdentitySession {
                access_token: format!("token-{}", id),
                user: IdentityUser { id, email: None },
            })
        }

        async fn add_to_group(&self, _user_id: &str, _group: &str) -> Result<(), IdentityError> {
            Ok(())
        }

        async fn sign_out(&self, _session: &IdentitySession) -> Result<(), IdentityError> {
            *self.sign_outs.lock().await += 1;
            Ok(())
        }
    }

    async fn setup(
        identity: FakeIdentity,
    ) -> (Arc<FakeIdentity>, Arc<MockBillingProvider>, Arc<InMemoryBillingStore>, ProvisioningWorkflow) {
        let identity = Arc::new(identity);
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let plans: Vec<Plan> = serde_json::from_value(serde_json::json!([
            { "planId": "free", "name": "Free" },
            { "planId": "pro", "name": "Pro", "monthlyPrice": 19, "yearlyPrice": 190 }
        ]))
        .unwrap();
        CatalogSynchronizer::new(provider.clone(), store.clone())
            .sync(plans)
            .await
            .unwrap();
        let workflow = ProvisioningWorkflow::new(identity.clone(), provider.clone(), store.clone());
        (identity, provider, store, workflow)
    }

    fn seed(email: &str) -> SeedUser {
        parse_seed_users(&format!(r#"[{{"email":"{}","password":"pw-123456"}}]"#, email))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_seed_file_defaults_and_interval_validation() {
        let users = parse_seed_users(
            r#"[{"email":"a@example.com","password":"x"},
                {"email":"b@example.com","password":"x","planId":"pro","interval":"year","paymentToken":"tok_visa"}]"#,
        )
        .unwrap();
        assert_eq!(users[0].plan_id, "free");
        assert_eq!(users[0].interval, BillingInterval::Month);
        assert_eq!(users[1].interval, BillingInterval::Year);
        assert_eq!(users[1].payment_token.as_deref(), Some("tok_visa"));

        let err = parse_seed_users(r#"[{"email":"a@example.com","password":"x","interval":"weekly"}]"#)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidInterval(_)));
    }

    #[tokio::test]
    async fn test_batch_continues_past_failed_user() {
        let (_, _, store, workflow) = setup(FakeIdentity::rejecting("two@example.com")).await;
        let users = vec![seed("one@example.com"), seed("two@example.com"), seed("three@example.com")];

        let report = workflow.run(&users).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.results[1].outcome, SeedOutcome::Failed { .. }));
        assert_eq!(store.subscription_count().await, 2);
    }

    #[tokio::test]
    async fn test_paid_plan_attaches_payment_method_before_subscribing() {
        let (identity, provider, store, workflow) = setup(FakeIdentity::default()).await;
        let mut user = seed("pro@example.com");
        user.plan_id = "pro".into();
        user.payment_token = Some("tok_visa".into());

        let provisioned = workflow.provision_user(&user).await.unwrap();

        assert_eq!(provisioned.plan_id, "pro");
        assert_eq!(provisioned.status, SubscriptionStatus::Active);

        let calls = provider.calls().await;
        let order: Vec<&str> = calls
            .iter()
            .map(String::as_str)
            .filter(|c| {
                matches!(
                    *c,
                    "create_payment_method"
                        | "attach_payment_method"
                        | "set_default_payment_method"
                        | "create_subscription"
                )
            })
            .collect();
        assert_eq!(
            order,
            [
                "create_payment_method",
                "attach_payment_method",
                "set_default_payment_method",
                "create_subscription"
            ]
        );

        let stored = store.get_subscription(&provisioned.user_id).await.unwrap().unwrap();
        assert!(stored.stripe_subscription_id.is_some());
        let default_pm = provider
            .default_payment_method(&stored.stripe_customer_id)
            .await
            .unwrap();
        assert!(default_pm.starts_with("pm_"));
        assert_eq!(*identity.sign_outs.lock().await, 1);
    }

    #[tokio::test]
    async fn test_existing_account_is_recovered_without_duplicates() {
        let (_, provider, _, workflow) = setup(FakeIdentity::default()).await;
        let mut user = seed("again@example.com");
        user.plan_id = "pro".into();
        user.payment_token = Some("tok_visa".into());

        let first = workflow.provision_user(&user).await.unwrap();
        let second = workflow.provision_user(&user).await.unwrap();

        assert!(!first.existing_account);
        assert!(second.existing_account);
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(provider.customer_count().await, 1);
        let subscriptions = provider
            .calls()
            .await
            .iter()
            .filter(|c| *c == "create_subscription")
            .count();
        assert_eq!(subscriptions, 1);
    }

    #[tokio::test]
    async fn test_declined_card_fails_user_and_still_signs_out() {
        let (identity, _, _, workflow) = setup(FakeIdentity::default()).await;
        let mut user = seed("declined@example.com");
        user.plan_id = "pro".into();
        user.payment_token = Some("tok_chargeDeclined".into());

        let report = workflow.run(&[user]).await;

        assert_eq!(report.failed(), 1);
        assert_eq!(*identity.sign_outs.lock().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_plan_is_reported() {
        let (_, _, _, workflow) = setup(FakeIdentity::default()).await;
        let mut user = seed("x@example.com");
        user.plan_id = "enterprise".into();

        assert!(matches!(
            workflow.provision_user(&user).await,
            Err(BillingError::NotFound(_))
        ));
    }
}
