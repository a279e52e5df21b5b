#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SaaS Kit API Library
//!
//! HTTP surface of the billing core: Stripe webhooks, plan listing, the
//! current-plan read model, portal sessions and the post-registration hook.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
