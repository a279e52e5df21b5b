//! Authentication module

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, require_internal_token, AuthUser, INTERNAL_TOKEN_HEADER};
