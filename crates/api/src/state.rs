//! Shared application state

use std::sync::Arc;

use saaskit_billing::{BillingService, BillingStore};

use crate::{auth::JwtManager, config::Config};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    /// Used directly by health checks and the plan listing
    pub store: Arc<dyn BillingStore>,
    /// `None` when billing is disabled
    pub billing: Option<BillingService>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn BillingStore>, billing: Option<BillingService>) -> Self {
        Self {
            jwt: JwtManager::new(&config.jwt_secret),
            config: Arc::new(config),
            store,
            billing,
        }
    }
}
