// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SaaSKit Billing Module
//!
//! Keeps the plan catalog, Stripe and per-user subscription state consistent.
//!
//! ## Features
//!
//! - **Plan Catalog**: Resolve plans by id or provider price id, always resolve the free plan
//! - **Catalog Sync**: Idempotently create/update Stripe products and append-only prices
//! - **Subscription Reconciliation**: Project Stripe subscriptions onto one record per user
//! - **Registration**: Stripe customer and free plan for new users
//! - **Webhooks**: Verify and dispatch Stripe events, with an audit log
//! - **Portal**: Stripe billing portal sessions
//! - **Provisioning**: Seed demo users with real or synthetic subscriptions

pub mod catalog;
pub mod catalog_sync;
pub mod client;
pub mod customer;
pub mod error;
pub mod identity;
pub mod memory;
pub mod portal;
pub mod provider;
pub mod provisioning;
pub mod store;
pub mod stripe_provider;
pub mod subscriptions;
pub mod webhooks;

// Catalog
pub use catalog::{CatalogFile, PlanCatalog};
pub use catalog_sync::{CatalogSynchronizer, SyncError, SyncReport};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerService, Registration};

// Error
pub use error::{BillingError, BillingResult, ProviderErrorKind};

// Identity
pub use identity::{
    HttpIdentityProvider, IdentityConfig, IdentityError, IdentityProvider, IdentitySession,
    IdentityUser,
};

// Portal
pub use portal::{PortalResponse, PortalService};

// Provider
pub use provider::{BillingProvider, RemotePrice, RemoteProduct, RemoteSubscription};

// Provisioning
pub use provisioning::{
    load_seed_users, parse_seed_users, BatchReport, ProvisionedUser, ProvisioningWorkflow,
    SeedOutcome, SeedResult, SeedUser,
};

// Store
pub use store::{BillingStore, PgBillingStore, WebhookEventResult};

// Subscriptions
pub use subscriptions::{CurrentPlan, ReconcileOutcome, SkipReason, SubscriptionReconciler};

// Webhooks
pub use webhooks::{
    parse_event, verify_signature, InvoiceRef, ParsedEvent, WebhookEvent, WebhookHandler,
    WebhookOutcome,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub catalog_sync: CatalogSynchronizer,
    pub customer: CustomerService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionReconciler,
    pub webhooks: WebhookHandler,
    config: StripeConfig,
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a billing service backed by Stripe and Postgres
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe: Arc<dyn BillingProvider> = Arc::new(StripeClient::new(config.clone()));
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        Self::with_backends(config, stripe, store)
    }

    /// Create a billing service over arbitrary provider and store implementations
    pub fn with_backends(
        config: StripeConfig,
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        Self {
            catalog: PlanCatalog::new(store.clone()),
            catalog_sync: CatalogSynchronizer::new(provider.clone(), store.clone()),
            customer: CustomerService::new(provider.clone(), store.clone()),
            portal: PortalService::new(provider.clone(), store.clone(), &config),
            subscriptions: SubscriptionReconciler::new(provider.clone(), store.clone()),
            webhooks: WebhookHandler::new(provider, store.clone()),
            config,
            store,
        }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }
}
