//! Access token validation
//!
//! Tokens are issued by the identity provider and signed with the shared
//! `JWT_SECRET`. The API only validates them.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Audience the identity provider puts on user access tokens
pub const AUDIENCE: &str = "authenticated";

/// Claims of an identity provider access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (identity provider user id)
    pub sub: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token in the identity provider's format (tests and local tooling)
    pub fn issue(&self, user_id: &str, email: &str, ttl: Duration) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id.to_string(),
            email: Some(email.to_string()),
            role: Some(AUDIENCE.to_string()),
            aud: Some(AUDIENCE.to_string()),
            iat: Some(now.unix_timestamp()),
            exp: (now + ttl).unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode a token. Only HS256 with the expected audience is accepted.
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_audience(&[AUDIENCE]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                | jsonwebtoken::errors::ErrorKind::InvalidAudience
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_issue_and_validate() {
        let jwt = JwtManager::new(SECRET);
        let token = jwt
            .issue("3f0c-user", "ada@example.com", Duration::hours(1))
            .unwrap();

        let claims = jwt.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "3f0c-user");
        assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(SECRET);
        let token = jwt
            .issue("3f0c-user", "ada@example.com", Duration::hours(-2))
            .unwrap();

        assert!(matches!(jwt.validate_token(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = JwtManager::new("another-secret-key-of-32-characters!!")
            .issue("3f0c-user", "ada@example.com", Duration::hours(1))
            .unwrap();

        assert!(matches!(
            JwtManager::new(SECRET).validate_token(&token),
            Err(JwtError::Invalid)
        ));
    }
}
