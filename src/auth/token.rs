use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::provider::{AuthValidator, Identity};
use crate::constants::{MAX_TOKEN_LEN, MAX_USERNAME_LEN};
use crate::core::UserId;
use crate::error::{RelayError, Result};

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (numeric user ID)
    pub sub: String,
    /// Username
    pub username: String,
    /// Expiration time (as UTC timestamp)
    pub exp: usize,
    /// Issued at (as UTC timestamp)
    pub iat: usize,
    /// Not before (as UTC timestamp)
    pub nbf: usize,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    /// Creates new claims for a user, valid for 24 hours
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self::with_expiration(user_id, username, 24)
    }

    /// Creates claims with custom expiration
    pub fn with_expiration(user_id: UserId, username: impl Into<String>, hours: usize) -> Self {
        let now = chrono::Utc::now().timestamp().max(0) as usize;

        Self {
            sub: user_id.to_string(),
            username: username.into(),
            exp: now + hours * 3600,
            iat: now,
            nbf: now,
            iss: None,
        }
    }

    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp().max(0) as usize;
        now > self.exp
    }
}

/// Manages JWT token operations
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    /// Creates a new token manager with a secret
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Require a specific issuer on every validated token
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Generates a JWT token for the given claims
    pub fn generate_token(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| RelayError::AuthError(format!("Failed to generate token: {}", e)))
    }

    /// Validates and decodes a JWT token
    pub fn validate_token(&self, token: &str) -> Result<TokenData<Claims>> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| RelayError::AuthError(format!("Invalid token: {}", e)))
    }

    /// Extracts claims from a token string
    pub fn get_claims(&self, token: &str) -> Result<Claims> {
        let token_data = self.validate_token(token)?;
        Ok(token_data.claims)
    }
}

/// Validates JWTs minted by an external login service
pub struct JwtAuthValidator {
    tokens: TokenManager,
}

impl JwtAuthValidator {
    pub fn new(tokens: TokenManager) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthValidator for JwtAuthValidator {
    async fn validate_token(&self, token: &str) -> Result<Identity> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(RelayError::AuthError("Token too long".to_string()));
        }
        if token.chars().any(|c| c.is_control()) {
            return Err(RelayError::AuthError(
                "Token contains invalid characters".to_string(),
            ));
        }

        let claims = self.tokens.get_claims(token)?;
        if claims.is_expired() {
            return Err(RelayError::AuthError("Token expired".to_string()));
        }

        let user_id = claims
            .sub
            .parse::<UserId>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| RelayError::AuthError("Invalid subject claim".to_string()))?;

        if claims.username.is_empty() || claims.username.len() > MAX_USERNAME_LEN {
            return Err(RelayError::AuthError("Invalid username claim".to_string()));
        }

        Ok(Identity::new(user_id, claims.username))
    }

    fn provider_name(&self) -> &'static str {
        "jwt"
    }
}

/// Extracts bearer token from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<String> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
