//! Access token decode and verification.
//!
//! Access tokens are EdDSA-signed JWTs binding the session's ephemeral
//! public key and an expiry. [`TokenVerifier`] is the seam the session
//! manager consumes; [`JwtVerifier`] is the production implementation.
//! Verification failures are recovered by regenerating the token and are
//! never surfaced to callers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Hex public key of the ephemeral keypair the token is bound to.
    pub ephemeral_key: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
    /// Provider-assigned user identifier, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid verification key: {0}")]
    InvalidKey(String),
}

/// Decode/verify seam consumed by the session manager.
pub trait TokenVerifier: Send + Sync {
    /// Decode the claims without any signature or expiry check.
    fn decode(&self, token: &str) -> Result<AccessClaims, TokenError>;

    /// Verify signature and expiry against the service public key (SPKI PEM)
    /// and return the claims.
    fn verify(&self, token: &str, public_key_pem: &str) -> Result<AccessClaims, TokenError>;
}

/// EdDSA JWT verifier.
#[derive(Debug, Default, Clone)]
pub struct JwtVerifier;

impl JwtVerifier {
    pub fn new() -> Self {
        Self
    }
}

impl TokenVerifier for JwtVerifier {
    fn decode(&self, token: &str) -> Result<AccessClaims, TokenError> {
        // Unverified decode: split the JWS compact form and parse the
        // payload segment directly.
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| TokenError::Malformed("not a compact JWT".to_string()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| TokenError::Malformed(format!("payload is not valid claims JSON: {}", e)))
    }

    fn verify(&self, token: &str, public_key_pem: &str) -> Result<AccessClaims, TokenError> {
        let key = DecodingKey::from_ed_pem(public_key_pem.as_bytes())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;

        let validation = Validation::new(Algorithm::EdDSA);
        let data = jsonwebtoken::decode::<AccessClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        Ok(data.claims)
    }
}
