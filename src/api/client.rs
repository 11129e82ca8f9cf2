//! Reqwest-backed implementation of the remote auth service contract.
//!
//! Endpoints:
//! - `POST {base}/auth` - mint one-time login/logout URLs for this origin
//! - `POST {base}/token` - exchange user token + ephemeral public key for
//!   a short-lived signed access token
//! - `GET {base}/public_key` - fetch the verification public key

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthOptions;

use super::{ApiError, AuthService, AuthUrls};

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    domain: &'a str,
    login_callback: &'a str,
    logout_callback: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    login_url: String,
    logout_url: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    user_token: &'a str,
    pub_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the remote auth service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    origin: String,
    login_callback: String,
    logout_callback: String,
}

impl AuthClient {
    pub fn new(options: &AuthOptions) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(options.request_timeout).build()?;

        Ok(Self {
            client,
            base_url: options.base_url.clone(),
            origin: options.origin.clone(),
            login_callback: options.login_callback.clone(),
            logout_callback: options.logout_callback.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if a response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl AuthService for AuthClient {
    async fn auth(&self) -> Result<AuthUrls, ApiError> {
        let url = self.url("/auth");
        let body = AuthRequest {
            domain: &self.origin,
            login_callback: &self.login_callback,
            logout_callback: &self.logout_callback,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let response = Self::check_response(response).await?;

        let parsed: AuthResponse = response.json().await?;
        debug!("One-time auth URLs minted");

        Ok(AuthUrls {
            login_url: parsed.login_url,
            logout_url: parsed.logout_url,
        })
    }

    async fn token(&self, user_token: &str, pub_key: &str) -> Result<String, ApiError> {
        let url = self.url("/token");
        let body = TokenRequest {
            user_token,
            pub_key,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let response = Self::check_response(response).await?;

        let parsed: TokenResponse = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(ApiError::Rejected(error));
        }

        parsed
            .access_token
            .ok_or_else(|| ApiError::InvalidResponse("token response missing access_token".to_string()))
    }

    async fn pub_key(&self) -> Result<String, ApiError> {
        let url = self.url("/public_key");

        let response = self.client.get(&url).send().await?;
        let response = Self::check_response(response).await?;

        Ok(response.text().await?)
    }
}
