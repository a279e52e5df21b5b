//! SaaS Kit Shared Types and Utilities
//!
//! Domain records, validation and database helpers shared by the billing core,
//! the HTTP API and the admin CLI.

pub mod db;
pub mod error;
pub mod telemetry;
pub mod types;

pub use db::*;
pub use error::*;
pub use telemetry::init_tracing;
pub use types::*;
