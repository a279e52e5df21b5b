//! SaaS Kit admin CLI: migrations, catalog sync and account seeding

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

/// Operator tooling for the billing core
#[derive(Parser)]
#[command(name = "saaskit-admin", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database URL (falls back to DATABASE_URL)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Push the plan catalog file to Stripe and write resolved ids back
    SyncCatalog {
        /// Catalog definition file
        #[arg(long, default_value = "config/plans.json")]
        file: PathBuf,

        /// Leave the catalog file untouched
        #[arg(long)]
        no_write: bool,
    },

    /// Rebuild the stored catalog from Stripe products tagged with a plan id
    BackfillCatalog {
        /// Write the rebuilt catalog to this file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Create accounts from a seed file, with their customers and subscriptions
    Seed {
        /// Seed user file
        #[arg(long)]
        file: PathBuf,
    },

    /// Re-read one user's subscription from Stripe
    SyncUser {
        #[arg(long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    saaskit_shared::init_tracing("info,saaskit_billing=debug");

    let cli = Cli::parse();
    let database_url = cli.database_url;

    let result = match cli.command {
        Commands::Migrate => commands::migrate(database_url).await,
        Commands::SyncCatalog { file, no_write } => {
            commands::sync_catalog(database_url, &file, !no_write).await
        }
        Commands::BackfillCatalog { file } => {
            commands::backfill_catalog(database_url, file.as_deref()).await
        }
        Commands::Seed { file } => commands::seed(database_url, &file).await,
        Commands::SyncUser { user_id } => commands::sync_user(database_url, &user_id).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
