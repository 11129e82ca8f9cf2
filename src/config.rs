//! Session manager configuration.
//!
//! `AuthOptions` carries everything a host application can tune: the auth
//! service endpoint, callback paths, ephemeral key TTL, and the timing knobs
//! for the keep-alive loop and the channel liveness watcher.

use std::time::Duration;

/// TTL for the ephemeral signing keypair (2 hours)
const DEFAULT_EPHEMERAL_KEY_TTL_SECS: u64 = 60 * 60 * 2;

/// How long before token expiry the keep-alive loop renews
const DEFAULT_RENEWAL_OFFSET_SECS: u64 = 30;

/// Initial retry delay after a failed keep-alive renewal.
/// Grows by x1.5 on each consecutive failure.
const DEFAULT_RENEWAL_ERROR_DELAY_MS: u64 = 250;

/// Poll interval for detecting a closed login window/frame.
/// Cross-origin isolation leaves polling as the only liveness signal.
const DEFAULT_LIVENESS_POLL_MS: u64 = 250;

/// Maximum attempts for a single access-token exchange before the
/// session is force-logged-out and the error surfaced.
const DEFAULT_TOKEN_EXCHANGE_ATTEMPTS: u32 = 3;

/// HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Base URL of the remote auth service, e.g. `https://auth.example.com/api/v1`.
    pub base_url: String,
    /// Origin of the calling application, sent when requesting one-time URLs.
    pub origin: String,
    /// Callback path appended by the service to the one-time login URL.
    pub login_callback: String,
    /// Callback path appended by the service to the one-time logout URL.
    pub logout_callback: String,
    /// Lifetime of the locally generated signing keypair.
    pub ephemeral_key_ttl: Duration,
    /// Whether login starts the background token renewal loop.
    pub keep_alive: bool,
    /// Renew the access token this long before its expiry.
    pub renewal_offset: Duration,
    /// Initial backoff after a failed renewal.
    pub renewal_error_delay: Duration,
    /// Poll interval for the login channel liveness watcher.
    pub liveness_poll_interval: Duration,
    /// Bounded retry budget for one access-token exchange.
    pub token_exchange_attempts: u32,
    /// Timeout applied to every auth service request.
    pub request_timeout: Duration,
}

impl AuthOptions {
    pub fn new(base_url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            origin: origin.into(),
            login_callback: "/callback".to_string(),
            logout_callback: "/".to_string(),
            ephemeral_key_ttl: Duration::from_secs(DEFAULT_EPHEMERAL_KEY_TTL_SECS),
            keep_alive: true,
            renewal_offset: Duration::from_secs(DEFAULT_RENEWAL_OFFSET_SECS),
            renewal_error_delay: Duration::from_millis(DEFAULT_RENEWAL_ERROR_DELAY_MS),
            liveness_poll_interval: Duration::from_millis(DEFAULT_LIVENESS_POLL_MS),
            token_exchange_attempts: DEFAULT_TOKEN_EXCHANGE_ATTEMPTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}
