//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Create a single-connection pool for migrations with a longer acquire timeout
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(120))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(180))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
