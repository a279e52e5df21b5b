//! SaaS Kit API server

use std::sync::Arc;

use anyhow::Context;
use saaskit_api::{create_router, AppState, Config};
use saaskit_billing::{BillingProvider, BillingService, BillingStore, PgBillingStore, StripeClient, StripeConfig};
use saaskit_shared::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    saaskit_shared::init_tracing("info,saaskit_api=debug,saaskit_billing=debug,tower_http=info");

    let config = Config::from_env().context("Invalid configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));

    let billing = if config.enable_billing {
        let stripe_config = StripeConfig::from_env().context("Invalid Stripe configuration")?;
        if stripe_config.webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook deliveries will be rejected");
        }
        let provider: Arc<dyn BillingProvider> = Arc::new(StripeClient::new(stripe_config.clone()));
        Some(BillingService::with_backends(stripe_config, provider, store.clone()))
    } else {
        tracing::warn!("Billing disabled (ENABLE_BILLING=false)");
        None
    };

    let bind_address = config.bind_address.clone();
    let app = create_router(AppState::new(config, store, billing));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
