//! HTTP client module for the remote auth service.
//!
//! This module provides the [`AuthService`] contract consumed by the
//! session manager and its [`AuthClient`] implementation backed by reqwest.
//!
//! The service exposes three endpoints: one-time login/logout URL minting,
//! user-token-for-access-token exchange, and the verification public key.

pub mod client;
pub mod error;

use async_trait::async_trait;

pub use client::AuthClient;
pub use error::ApiError;

/// One-time login and logout URLs minted for this origin.
#[derive(Debug, Clone)]
pub struct AuthUrls {
    pub login_url: String,
    pub logout_url: String,
}

/// Contract of the remote identity/token-exchange service.
///
/// The session manager only ever talks to the service through this trait,
/// so tests (and alternate transports) can substitute their own
/// implementation.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Mint one-time login and logout URLs parameterized by the caller's
    /// origin and callback paths.
    async fn auth(&self) -> Result<AuthUrls, ApiError>;

    /// Exchange a user token and an ephemeral public key (hex) for a
    /// short-lived signed access token.
    async fn token(&self, user_token: &str, pub_key: &str) -> Result<String, ApiError>;

    /// Fetch the service's verification public key (SPKI PEM).
    async fn pub_key(&self) -> Result<String, ApiError>;
}
