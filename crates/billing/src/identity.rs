//! Identity provider client
//!
//! Account operations used by the provisioning workflow, against a
//! GoTrue-compatible auth API. Transient failures (transport errors, 429, 5xx)
//! are retried with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::error::{BillingError, BillingResult, ProviderErrorKind};

/// Base delay for retry backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Maximum delay between retries
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Maximum number of retries after the first attempt
const MAX_RETRIES: usize = 3;

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Account already exists: {0}")]
    AlreadyExists(String),

    #[error("Identity request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Identity service unreachable: {0}")]
    Transport(String),

    #[error("Invalid identity response: {0}")]
    InvalidResponse(String),
}

impl IdentityError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<IdentityError> for BillingError {
    fn from(err: IdentityError) -> Self {
        BillingError::provider(ProviderErrorKind::Identity, err.to_string())
    }
}

/// An identity account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A signed-in session
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySession {
    pub access_token: String,
    pub user: IdentityUser,
}

/// Account operations needed to provision users
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create a confirmed account. Fails with [`IdentityError::AlreadyExists`] for a taken email.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<IdentityUser, IdentityError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, IdentityError>;

    async fn add_to_group(&self, user_id: &str, group: &str) -> Result<(), IdentityError>;

    async fn sign_out(&self, session: &IdentitySession) -> Result<(), IdentityError>;
}

/// Identity service connection settings
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub url: String,
    /// Admin key for account management
    pub service_key: String,
    /// Public key used for password sign-in
    pub anon_key: String,
}

impl IdentityConfig {
    pub fn from_env() -> BillingResult<Self> {
        let url = std::env::var("IDENTITY_URL")
            .map_err(|_| BillingError::Config("IDENTITY_URL not set".to_string()))?;
        let service_key = std::env::var("IDENTITY_SERVICE_KEY")
            .map_err(|_| BillingError::Config("IDENTITY_SERVICE_KEY not set".to_string()))?;
        let anon_key = std::env::var("IDENTITY_ANON_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| service_key.clone());

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            service_key,
            anon_key,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error_code: Option<String>,
    #[serde(alias = "message", alias = "error_description")]
    msg: Option<String>,
}

/// [`IdentityProvider`] over the auth REST API
#[derive(Clone)]
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: IdentityConfig,
    retry_base_ms: u64,
    max_retries: usize,
}

impl HttpIdentityProvider {
    pub fn new(config: IdentityConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            retry_base_ms: RETRY_BASE_DELAY_MS,
            max_retries: MAX_RETRIES,
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(IdentityConfig::from_env()?)
    }

    /// Override the retry policy
    pub fn with_retry_policy(mut self, base_delay_ms: u64, max_retries: usize) -> Self {
        self.retry_base_ms = base_delay_ms;
        self.max_retries = max_retries;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url, path)
    }

    fn admin(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.config.service_key)
            .bearer_auth(&self.config.service_key)
    }

    /// Send a request built by `build`, retrying transient failures. Returns the body on success.
    async fn send<F>(&self, operation: &'static str, build: F) -> Result<String, IdentityError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(self.retry_base_ms)
            .max_delay(RETRY_MAX_DELAY)
            .take(self.max_retries)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.send_once(&build).await;
            match &result {
                Err(e) if e.is_transient() => {
                    tracing::debug!(operation, error = %e, "Transient identity error - will retry");
                    Err(result)
                }
                _ => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    async fn send_once<F>(&self, build: &F) -> Result<String, IdentityError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let response = build()
            .send()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        let error: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = error.msg.clone().unwrap_or_else(|| body.clone());
        let already_exists = matches!(error.error_code.as_deref(), Some("email_exists" | "user_already_exists"))
            || message.to_lowercase().contains("already been registered")
            || message.to_lowercase().contains("already registered");

        if already_exists && (status.as_u16() == 422 || status.as_u16() == 400) {
            return Err(IdentityError::AlreadyExists(message));
        }

        Err(IdentityError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn parse<T: DeserializeOwned>(body: &str) -> Result<T, IdentityError> {
        serde_json::from_str(body).map_err(|e| IdentityError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<IdentityUser, IdentityError> {
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "email_confirm": true,
            "user_metadata": { "name": name },
        });
        let url = self.url("/auth/v1/admin/users");
        let response = self
            .send("sign_up", || self.admin(self.http.post(&url)).json(&body))
            .await?;
        let user: IdentityUser = Self::parse(&response)?;

        tracing::info!(user_id = %user.id, "Created identity account");
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, IdentityError> {
        let body = serde_json::json!({ "email": email, "password": password });
        let url = self.url("/auth/v1/token");
        let response = self
            .send("sign_in", || {
                self.http
                    .post(&url)
                    .query(&[("grant_type", "password")])
                    .header("apikey", &self.config.anon_key)
                    .json(&body)
            })
            .await?;
        Self::parse(&response)
    }

    async fn add_to_group(&self, user_id: &str, group: &str) -> Result<(), IdentityError> {
        let body = serde_json::json!({ "app_metadata": { "groups": [group] } });
        let url = self.url(&format!("/auth/v1/admin/users/{}", user_id));
        self.send("add_to_group", || self.admin(self.http.put(&url)).json(&body))
            .await?;

        tracing::info!(user_id = %user_id, group = %group, "Added user to group");
        Ok(())
    }

    async fn sign_out(&self, session: &IdentitySession) -> Result<(), IdentityError> {
        let url = self.url("/auth/v1/logout");
        self.send("sign_out", || {
            self.http
                .post(&url)
                .header("apikey", &self.config.anon_key)
                .bearer_auth(&session.access_token)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::ServerGuard) -> HttpIdentityProvider {
        HttpIdentityProvider::new(IdentityConfig {
            url: server.url(),
            service_key: "service-key".into(),
            anon_key: "anon-key".into(),
        })
        .unwrap()
        .with_retry_policy(1, 2)
    }

    #[tokio::test]
    async fn test_sign_up_returns_user() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/v1/admin/users")
            .match_header("apikey", "service-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "email": "ada@example.com",
                "email_confirm": true
            })))
            .with_status(200)
            .with_body(r#"{"id":"3f0c","email":"ada@example.com","aud":"authenticated"}"#)
            .create_async()
            .await;

        let user = provider(&server)
            .sign_up("ada@example.com", "hunter22", Some("Ada"))
            .await
            .unwrap();

        assert_eq!(user.id, "3f0c");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_existing_email_maps_to_already_exists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/v1/admin/users")
            .with_status(422)
            .with_body(r#"{"code":422,"error_code":"email_exists","msg":"A user with this email address has already been registered"}"#)
            .create_async()
            .await;

        let err = provider(&server)
            .sign_up("ada@example.com", "hunter22", None)
            .await
            .unwrap_err();

        assert!(matches!(err, IdentityError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/v1/token")
            .match_query(Matcher::UrlEncoded("grant_type".into(), "password".into()))
            .with_status(503)
            .with_body("upstream unavailable")
            .expect(3)
            .create_async()
            .await;

        let err = provider(&server)
            .sign_in("ada@example.com", "hunter22")
            .await
            .unwrap_err();

        assert!(matches!(err, IdentityError::Rejected { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/v1/token")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = provider(&server)
            .sign_in("ada@example.com", "wrong")
            .await
            .unwrap_err();

        match err {
            IdentityError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid login credentials");
            }
            other => panic!("unexpected error {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sign_in_and_sign_out() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/v1/token")
            .match_query(Matcher::Any)
            .match_header("apikey", "anon-key")
            .with_status(200)
            .with_body(r#"{"access_token":"jwt-abc","token_type":"bearer","user":{"id":"3f0c"}}"#)
            .create_async()
            .await;
        let logout = server
            .mock("POST", "/auth/v1/logout")
            .match_header("authorization", "Bearer jwt-abc")
            .with_status(204)
            .create_async()
            .await;

        let identity = provider(&server);
        let session = identity.sign_in("ada@example.com", "hunter22").await.unwrap();
        assert_eq!(session.user.id, "3f0c");
        identity.sign_out(&session).await.unwrap();
        logout.assert_async().await;
    }

    #[test]
    fn test_identity_error_maps_to_provider_kind() {
        let err: BillingError = IdentityError::Transport("refused".into()).into();
        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::Identity));
    }
}
