//! Bearer token identity
//!
//! Tokens are HS256 JWTs whose `sub` claim is the account name. Tollgate only
//! validates them; the dev-mode `generate_token` exists so a local gateway
//! can be exercised without a separate login service.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{Result, TollgateError};

/// Payload stored in JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account name
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT validator and generator
#[derive(Clone)]
pub struct JwtValidator {
    secret: String,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Returns an error if the secret is empty or too short
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(TollgateError::Config("JWT_SECRET is required in production mode".into()));
        }

        if secret.len() < 32 {
            return Err(TollgateError::Config("JWT_SECRET must be at least 32 characters".into()));
        }

        Ok(Self {
            secret,
            expiry_seconds,
        })
    }

    /// Create a validator for dev mode (allows empty secret)
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    pub fn generate_token(&self, account: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TollgateError::Internal(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            sub: account.to_string(),
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| TollgateError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Verify and decode a JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let validation = Validation::default();

        match decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation) {
            Ok(token_data) if token_data.claims.sub.trim().is_empty() => {
                Err(TollgateError::Unauthorized("Token has no subject".into()))
            }
            Ok(token_data) => Ok(token_data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let error_msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Token validation failed",
                };
                Err(TollgateError::Unauthorized(error_msg.into()))
            }
        }
    }

    /// Account named by the request's `Authorization` header
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<String> {
        let token = extract_token_from_header(auth_header)
            .ok_or_else(|| TollgateError::Unauthorized("Missing bearer token".into()))?;
        Ok(self.verify_token(token)?.sub)
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}
