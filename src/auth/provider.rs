//! Pluggable token validation
//!
//! The relay never mints credentials. It hands the opaque token presented
//! at connect time to an `AuthValidator` and trusts the identity it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::UserId;
use crate::error::Result;

/// Verified identity bound to a connection for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Trait for token validation backends
///
/// Implementations return `RelayError::AuthError` for bad or expired tokens
/// and `RelayError::ServiceUnavailable` when the backing service cannot be
/// reached, so the engine can pick the right close code.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Validate a token and resolve the identity behind it
    async fn validate_token(&self, token: &str) -> Result<Identity>;

    /// Get the validator name for logging
    fn provider_name(&self) -> &'static str;
}
