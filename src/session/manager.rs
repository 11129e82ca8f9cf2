//! Session lifecycle: login, logout, access token caching and renewal,
//! request signing.
//!
//! One manager owns one session. State lives behind a synchronous mutex
//! that is never held across an await; compound operations (login, token
//! regeneration, logout) are serialised by an async gate so concurrent
//! callers observe one consistent outcome instead of racing handshakes or
//! double-exchanging tokens.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{AuthClient, AuthService};
use crate::config::AuthOptions;
use crate::error::AuthError;
use crate::login::{
    ChannelHost, FrameTarget, LoginFlow, DEFAULT_POPUP_HEIGHT, DEFAULT_POPUP_TITLE,
    DEFAULT_POPUP_WIDTH,
};

use super::keys::{EphemeralKey, SignableMessage};
use super::storage::{KeyringStore, TokenStore};
use super::token::{AccessClaims, JwtVerifier, TokenVerifier};

/// Initial delay between bounded token-exchange retries; doubles per retry.
const EXCHANGE_RETRY_DELAY_MS: u64 = 250;

/// Growth factor for the renewal loop's error backoff
const RENEWAL_BACKOFF_FACTOR: f64 = 1.5;

/// Sleep this long before the first renewal attempt when the token is
/// already past its renewal point.
fn renewal_delay(exp_secs: i64, now_ms: i64, offset: Duration) -> Duration {
    let fire_at_ms = exp_secs
        .saturating_mul(1000)
        .saturating_sub(offset.as_millis() as i64);
    Duration::from_millis(fire_at_ms.saturating_sub(now_ms).max(0) as u64)
}

fn grow_backoff(delay: Duration) -> Duration {
    delay.mul_f64(RENEWAL_BACKOFF_FACTOR)
}

#[derive(Default)]
struct SessionState {
    user_token: Option<String>,
    access_token: Option<String>,
    server_public_key: Option<String>,
    ephemeral_key: Option<EphemeralKey>,
}

impl SessionState {
    /// Current ephemeral key, rotating first if absent or expired.
    /// Rotation invalidates any access token bound to the previous key;
    /// the cache check catches that on the next use.
    fn fresh_key(&mut self, ttl: Duration) -> &EphemeralKey {
        if self.ephemeral_key.as_ref().map_or(true, |key| key.has_expired()) {
            debug!("rotating ephemeral keypair");
            self.ephemeral_key = Some(EphemeralKey::generate(ttl));
        }
        self.ephemeral_key.get_or_insert_with(|| EphemeralKey::generate(ttl))
    }
}

struct SessionInner {
    options: AuthOptions,
    api: Arc<dyn AuthService>,
    store: Arc<dyn TokenStore>,
    verifier: Arc<dyn TokenVerifier>,
    login: LoginFlow,
    state: Mutex<SessionState>,
    /// Serialises login, token regeneration and logout.
    gate: tokio::sync::Mutex<()>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SessionInner>,
}

/// Client-side session manager.
///
/// Composes the login flow, the remote auth service, the ephemeral signing
/// key and the token verifier into one race-free session. Construct it
/// inside a tokio runtime; the message listener and the keep-alive loop
/// are background tasks.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Production wiring: reqwest client, OS keychain, EdDSA verifier.
    pub fn new(options: AuthOptions, host: Arc<dyn ChannelHost>) -> Result<Self, AuthError> {
        let api = Arc::new(AuthClient::new(&options)?);
        let store =
            Arc::new(KeyringStore::new().map_err(|e| AuthError::Storage(e.to_string()))?);
        Ok(Self::with_components(
            options,
            api,
            host,
            store,
            Arc::new(JwtVerifier::new()),
        ))
    }

    /// Wire the manager from explicit collaborator implementations.
    pub fn with_components(
        options: AuthOptions,
        api: Arc<dyn AuthService>,
        host: Arc<dyn ChannelHost>,
        store: Arc<dyn TokenStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        // A session persisted by a previous process is restored eagerly;
        // an unreachable store just means logged out.
        let user_token = match store.load() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "durable storage unavailable, starting logged out");
                None
            }
        };

        let login = LoginFlow::new(api.clone(), host, options.liveness_poll_interval);
        let inner = Arc::new_cyclic(|weak| SessionInner {
            options,
            api,
            store,
            verifier,
            login,
            state: Mutex::new(SessionState {
                user_token,
                ..SessionState::default()
            }),
            gate: tokio::sync::Mutex::new(()),
            renewal: Mutex::new(None),
            weak_self: weak.clone(),
        });

        Self { inner }
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.logged_in()
    }

    /// Hex public half of the current ephemeral key, rotating it first if
    /// needed. This is the value bound into freshly minted access tokens.
    pub fn ephemeral_public_key(&self) -> String {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        state
            .fresh_key(self.inner.options.ephemeral_key_ttl)
            .public_key_hex()
            .to_string()
    }

    /// Log in. Idempotent: an already-authenticated session only refreshes
    /// its access token. With a `target`, the handshake runs in a frame
    /// injected into that container; otherwise in a centred popup.
    pub async fn login(&self, target: Option<&FrameTarget>) -> Result<(), AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.login_locked(target).await
    }

    /// Log out: ping the provider's logout side-channel (best effort),
    /// cancel the renewal loop, clear durable storage and in-memory tokens.
    pub async fn logout(&self) {
        let _gate = self.inner.gate.lock().await;
        self.inner.logout_locked().await;
    }

    /// Current access token, cache-first. A cached token is returned
    /// without any network call while it verifies against the service
    /// public key and is bound to the current ephemeral key; otherwise it
    /// is regenerated through a bounded exchange.
    ///
    /// Requires a logged-in session.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_access_token().await
    }

    /// User token, running the popup login first if needed.
    pub async fn user_token(&self) -> Result<String, AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_login().await?;
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .user_token
            .clone()
            .ok_or(AuthError::NotLoggedIn)
    }

    /// Decoded claims of the current access token, logging in and minting
    /// first if needed.
    pub async fn payload(&self) -> Result<AccessClaims, AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_login().await?;
        let token = self.inner.ensure_access_token().await?;
        self.inner.verifier.decode(&token).map_err(|e| {
            AuthError::Api(crate::api::ApiError::InvalidResponse(format!(
                "service issued an undecodable access token: {}",
                e
            )))
        })
    }

    /// Authentication headers for an outbound HTTP request, with optional
    /// caller headers merged on top.
    ///
    /// Merge policy: signer-produced headers always win. A caller header
    /// whose name (case-insensitive) collides with a credential header is
    /// ignored and logged, so callers can never clobber authentication.
    pub async fn request_headers(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        extra_headers: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_login().await?;
        let token = self.inner.ensure_access_token().await?;

        let input = SignableMessage::from_request(method, url, body);
        let mut headers = self.inner.sign(&input, &token);
        if let Some(extra) = extra_headers {
            merge_headers(&mut headers, extra);
        }
        Ok(headers)
    }

    /// Authentication headers for an opaque application payload (no HTTP
    /// method or URL).
    pub async fn message_credentials(
        &self,
        message: Option<&[u8]>,
    ) -> Result<BTreeMap<String, String>, AuthError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_login().await?;
        let token = self.inner.ensure_access_token().await?;
        Ok(self.inner.sign(&SignableMessage::from_message(message), &token))
    }

    /// Release background resources: the renewal loop and the login flow's
    /// message subscription. Also run on drop.
    pub fn dispose(&self) {
        self.inner.cancel_renewal();
        self.inner.login.dispose();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl SessionInner {
    fn logged_in(&self) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .user_token
            .is_some()
    }

    async fn ensure_login(&self) -> Result<(), AuthError> {
        if self.logged_in() {
            Ok(())
        } else {
            self.login_locked(None).await
        }
    }

    async fn login_locked(&self, target: Option<&FrameTarget>) -> Result<(), AuthError> {
        if !self.logged_in() {
            let handshake = async {
                match target {
                    Some(target) => self.login.from_frame(target).await,
                    None => {
                        self.login
                            .from_popup(DEFAULT_POPUP_TITLE, DEFAULT_POPUP_WIDTH, DEFAULT_POPUP_HEIGHT)
                            .await
                    }
                }
            };

            // The user token is only accepted once the verification key is
            // also in hand; a failure on either side persists nothing.
            let (user_token, _public_key) =
                futures::try_join!(handshake, self.server_public_key())?;

            info!("handshake complete, persisting user token");
            if let Err(e) = self.store.save(&user_token) {
                warn!(error = %e, "could not persist user token; session will not survive restart");
            }
            self.state
                .lock()
                .expect("state lock poisoned")
                .user_token = Some(user_token);
        }

        self.ensure_access_token().await?;

        if self.options.keep_alive {
            self.start_renewal();
        }
        Ok(())
    }

    async fn logout_locked(&self) {
        if let Err(e) = self.login.logout().await {
            warn!(error = %e, "logout side-channel failed");
        }
        self.cancel_renewal();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "could not clear durable storage");
        }

        let mut state = self.state.lock().expect("state lock poisoned");
        state.user_token = None;
        state.access_token = None;
        debug!("session cleared");
    }

    /// Service verification key, fetched once per manager instance.
    async fn server_public_key(&self) -> Result<String, AuthError> {
        let cached = self
            .state
            .lock()
            .expect("state lock poisoned")
            .server_public_key
            .clone();
        if let Some(key) = cached {
            return Ok(key);
        }

        let key = self.api.pub_key().await?;
        self.state
            .lock()
            .expect("state lock poisoned")
            .server_public_key = Some(key.clone());
        Ok(key)
    }

    async fn ensure_access_token(&self) -> Result<String, AuthError> {
        let cached = {
            let mut state = self.state.lock().expect("state lock poisoned");
            match state.access_token.clone() {
                Some(token) => {
                    let key_hex = state
                        .fresh_key(self.options.ephemeral_key_ttl)
                        .public_key_hex()
                        .to_string();
                    Some((token, key_hex))
                }
                None => None,
            }
        };

        if let Some((token, key_hex)) = cached {
            match self.cached_token_valid(&token, &key_hex).await {
                Ok(()) => return Ok(token),
                Err(reason) => {
                    debug!(reason = %reason, "cached access token rejected, regenerating")
                }
            }
        }

        self.exchange_access_token().await
    }

    /// Why a cached token cannot be reused, if it cannot. Verification
    /// failures here are recovered by regeneration, never surfaced.
    async fn cached_token_valid(&self, token: &str, key_hex: &str) -> Result<(), String> {
        let public_key = self
            .server_public_key()
            .await
            .map_err(|e| format!("verification key unavailable: {}", e))?;
        let claims = self
            .verifier
            .verify(token, &public_key)
            .map_err(|e| e.to_string())?;
        if claims.ephemeral_key != key_hex {
            return Err("ephemeral key rotated since the token was minted".to_string());
        }
        Ok(())
    }

    /// Exchange the user token for a fresh access token, with a bounded
    /// retry budget. Exhaustion clears the session (the user token itself
    /// may be at fault) and surfaces the last error.
    async fn exchange_access_token(&self) -> Result<String, AuthError> {
        let (user_token, pub_key) = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let user_token = state.user_token.clone().ok_or(AuthError::NotLoggedIn)?;
            let pub_key = state
                .fresh_key(self.options.ephemeral_key_ttl)
                .public_key_hex()
                .to_string();
            (user_token, pub_key)
        };

        let attempts = self.options.token_exchange_attempts.max(1);
        let mut retry_delay = Duration::from_millis(EXCHANGE_RETRY_DELAY_MS);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.api.token(&user_token, &pub_key).await {
                Ok(token) => {
                    self.state
                        .lock()
                        .expect("state lock poisoned")
                        .access_token = Some(token.clone());
                    debug!("access token minted");
                    return Ok(token);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "access token exchange failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay).await;
                        retry_delay *= 2;
                    }
                }
            }
        }

        error!("access token exchange exhausted its retry budget, forcing logout");
        self.logout_locked().await;
        Err(AuthError::TokenExchangeFailed(last_error.unwrap_or(
            crate::api::ApiError::InvalidResponse("no exchange attempt was made".to_string()),
        )))
    }

    /// One renewal attempt on behalf of the keep-alive loop. Transient by
    /// contract: failures are the loop's to back off on, not to log out.
    async fn renew_once(&self) -> Result<(), AuthError> {
        let _gate = self.gate.lock().await;
        if !self.logged_in() {
            return Ok(());
        }

        let (user_token, pub_key) = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let user_token = state.user_token.clone().ok_or(AuthError::NotLoggedIn)?;
            let pub_key = state
                .fresh_key(self.options.ephemeral_key_ttl)
                .public_key_hex()
                .to_string();
            (user_token, pub_key)
        };

        let token = self
            .api
            .token(&user_token, &pub_key)
            .await
            .map_err(AuthError::TokenExchangeFailed)?;
        self.state
            .lock()
            .expect("state lock poisoned")
            .access_token = Some(token);
        debug!("access token renewed");
        Ok(())
    }

    fn sign(&self, input: &SignableMessage, token: &str) -> BTreeMap<String, String> {
        let mut state = self.state.lock().expect("state lock poisoned");
        state
            .fresh_key(self.options.ephemeral_key_ttl)
            .make_credentials(input, token)
    }

    fn start_renewal(&self) {
        let mut slot = self.renewal.lock().expect("renewal lock poisoned");
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let weak = self.weak_self.clone();
        let offset = self.options.renewal_offset;
        let initial_error_delay = self.options.renewal_error_delay;
        *slot = Some(tokio::spawn(renewal_loop(weak, offset, initial_error_delay)));
        debug!("keep-alive renewal loop started");
    }

    fn cancel_renewal(&self) {
        if let Some(handle) = self
            .renewal
            .lock()
            .expect("renewal lock poisoned")
            .take()
        {
            handle.abort();
            debug!("keep-alive renewal loop cancelled");
        }
    }
}

/// Background keep-alive: renew the access token `offset` before each
/// expiry, backing off x1.5 on consecutive failures (reset on success).
/// Exits when the session logs out or the manager is dropped; every error
/// is caught and logged so the loop can never take the host down with it.
async fn renewal_loop(weak: Weak<SessionInner>, offset: Duration, initial_error_delay: Duration) {
    let mut error_delay = initial_error_delay;

    loop {
        let delay = {
            let Some(inner) = weak.upgrade() else { return };
            if !inner.logged_in() {
                return;
            }
            let token = inner
                .state
                .lock()
                .expect("state lock poisoned")
                .access_token
                .clone();
            match token {
                None => Duration::ZERO,
                Some(token) => match inner.verifier.decode(&token) {
                    Ok(claims) => {
                        renewal_delay(claims.exp, Utc::now().timestamp_millis(), offset)
                    }
                    Err(e) => {
                        warn!(error = %e, "cached access token undecodable, renewing now");
                        Duration::ZERO
                    }
                },
            }
        };

        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        // A timer that outlives its session must not revive cleared state.
        if !inner.logged_in() {
            return;
        }

        match inner.renew_once().await {
            Ok(()) => {
                error_delay = initial_error_delay;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = error_delay.as_millis() as u64,
                    "token renewal failed, backing off"
                );
                drop(inner);
                tokio::time::sleep(error_delay).await;
                error_delay = grow_backoff(error_delay);
            }
        }
    }
}

fn merge_headers(signed: &mut BTreeMap<String, String>, extra: &BTreeMap<String, String>) {
    for (name, value) in extra {
        let normalized = name.to_ascii_lowercase();
        if signed.contains_key(&normalized) {
            warn!(header = %normalized, "caller header collides with a credential header, ignoring");
            continue;
        }
        signed.insert(normalized, value.clone());
    }
}
