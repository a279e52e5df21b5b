//! Subcommand implementations. Each returns `Ok(false)` when the run finished
//! but reported failures.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use saaskit_billing::{
    load_seed_users, BillingProvider, BillingStore, CatalogFile, CatalogSynchronizer,
    HttpIdentityProvider, PgBillingStore, ProvisioningWorkflow, StripeClient,
    SubscriptionReconciler,
};
use saaskit_shared::{create_migration_pool, create_pool, run_migrations};
use serde::Serialize;

struct Backends {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

async fn connect(database_url: Option<String>) -> anyhow::Result<Backends> {
    let Some(url) = database_url else {
        bail!("DATABASE_URL not set");
    };
    let pool = create_pool(&url, 2)
        .await
        .context("Failed to connect to database")?;
    let stripe = StripeClient::from_env().context("Invalid Stripe configuration")?;

    Ok(Backends {
        provider: Arc::new(stripe),
        store: Arc::new(PgBillingStore::new(pool)),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn migrate(database_url: Option<String>) -> anyhow::Result<bool> {
    let Some(url) = database_url else {
        bail!("DATABASE_URL not set");
    };
    let pool = create_migration_pool(&url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Migration failed")?;
    Ok(true)
}

pub async fn sync_catalog(
    database_url: Option<String>,
    file: &Path,
    write_back: bool,
) -> anyhow::Result<bool> {
    let catalog = CatalogFile::load(file)?;
    catalog
        .validate()
        .with_context(|| format!("Invalid catalog {}", file.display()))?;

    let backends = connect(database_url).await?;
    let synchronizer = CatalogSynchronizer::new(backends.provider, backends.store);
    let report = synchronizer.sync(catalog.plans).await?;

    if write_back {
        CatalogFile {
            plans: report.plans.clone(),
        }
        .save(file)?;
    }

    print_json(&report)?;
    if !report.is_success() {
        tracing::warn!(failed = report.errors.len(), "Catalog sync finished with errors");
    }
    Ok(report.is_success())
}

pub async fn backfill_catalog(
    database_url: Option<String>,
    file: Option<&Path>,
) -> anyhow::Result<bool> {
    let backends = connect(database_url).await?;
    let synchronizer = CatalogSynchronizer::new(backends.provider, backends.store);
    let plans = synchronizer.backfill_from_provider().await?;

    let catalog = CatalogFile { plans };
    match file {
        Some(path) => catalog.save(path)?,
        None => print!("{}", catalog.to_json()?),
    }
    Ok(true)
}

pub async fn seed(database_url: Option<String>, file: &Path) -> anyhow::Result<bool> {
    let users = load_seed_users(file)?;
    let backends = connect(database_url).await?;
    let identity =
        HttpIdentityProvider::from_env().context("Invalid identity provider configuration")?;

    let workflow = ProvisioningWorkflow::new(Arc::new(identity), backends.provider, backends.store);
    let report = workflow.run(&users).await;

    print_json(&report)?;
    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Seeding finished"
    );
    Ok(report.is_success())
}

pub async fn sync_user(database_url: Option<String>, user_id: &str) -> anyhow::Result<bool> {
    let backends = connect(database_url).await?;
    let reconciler = SubscriptionReconciler::new(backends.provider, backends.store);

    let outcome = reconciler.sync_user(user_id).await?;
    if !outcome.is_applied() {
        tracing::warn!(user_id = %user_id, outcome = ?outcome, "Subscription sync skipped");
    }
    print_json(&reconciler.current_plan(user_id).await?)?;
    Ok(outcome.is_applied())
}
