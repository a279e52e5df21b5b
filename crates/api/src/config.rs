//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_origin: Option<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    /// HS256 secret shared with the identity provider's access tokens
    pub jwt_secret: String,
    /// Shared secret for the identity provider's post-registration hook
    pub internal_api_token: String,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|o| !o.is_empty()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            // Authentication
            jwt_secret: strong_secret("JWT_SECRET")?,
            internal_api_token: strong_secret("INTERNAL_API_TOKEN")?,

            // Feature flags
            enable_billing: env::var("ENABLE_BILLING")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

/// Secrets must be at least 32 characters
fn strong_secret(name: &'static str) -> Result<String, ConfigError> {
    let secret = env::var(name).map_err(|_| ConfigError::Missing(name))?;
    if secret.len() < 32 {
        return Err(ConfigError::WeakSecret(name));
    }
    Ok(secret)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0} must be at least 32 characters")]
    WeakSecret(&'static str),
}
