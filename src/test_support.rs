//! Shared test doubles: a token-minting auth service, a scriptable channel
//! host, and an in-memory token store.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use pkcs8::LineEnding;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;

use crate::api::{ApiError, AuthService, AuthUrls};
use crate::login::{
    ChannelError, ChannelHost, FrameTarget, LoginChannel, MessageRouter, MessageSubscription,
    PopupGeometry, ScreenMetrics,
};
use crate::session::storage::{StorageError, TokenStore};
use crate::session::token::AccessClaims;

/// Build a `USER_TOKEN` wire message.
pub fn user_token_message(token: &str, from: &str) -> String {
    serde_json::json!({"type": "USER_TOKEN", "token": token, "from": from}).to_string()
}

/// Mints real EdDSA JWTs, standing in for the identity provider's signer.
pub struct TokenIssuer {
    signing_key: SigningKey,
    public_key_pem: String,
}

impl TokenIssuer {
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let public_key_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("public key PEM encoding failed");
        Self {
            signing_key,
            public_key_pem,
        }
    }

    pub fn public_key_pem(&self) -> String {
        self.public_key_pem.clone()
    }

    /// Issue a token bound to `ephemeral_key_hex` expiring `ttl_secs` from
    /// now (negative for already-expired tokens).
    pub fn issue(&self, ephemeral_key_hex: &str, ttl_secs: i64) -> String {
        let claims = AccessClaims {
            ephemeral_key: ephemeral_key_hex.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
            user_id: Some("user-1".to_string()),
        };
        let pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private key PEM encoding failed");
        let key = EncodingKey::from_ed_pem(pem.as_bytes()).expect("bad encoding key");
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), &claims, &key)
            .expect("JWT encoding failed")
    }
}

/// Scriptable auth service with call counters and failure switches.
pub struct MockAuthService {
    issuer: TokenIssuer,
    pub auth_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub pub_key_calls: AtomicUsize,
    fail_token: AtomicBool,
    fail_pub_key: AtomicBool,
    token_ttl_secs: AtomicI64,
}

impl MockAuthService {
    pub fn new() -> Self {
        Self {
            issuer: TokenIssuer::new(),
            auth_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
            pub_key_calls: AtomicUsize::new(0),
            fail_token: AtomicBool::new(false),
            fail_pub_key: AtomicBool::new(false),
            token_ttl_secs: AtomicI64::new(60),
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn set_fail_token(&self, fail: bool) {
        self.fail_token.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pub_key(&self, fail: bool) {
        self.fail_pub_key.store(fail, Ordering::SeqCst);
    }

    pub fn set_token_ttl(&self, secs: i64) {
        self.token_ttl_secs.store(secs, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthService for MockAuthService {
    async fn auth(&self) -> Result<AuthUrls, ApiError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AuthUrls {
            login_url: "https://auth.test/login/once".to_string(),
            logout_url: "https://auth.test/logout/once".to_string(),
        })
    }

    async fn token(&self, _user_token: &str, pub_key: &str) -> Result<String, ApiError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("user token rejected".to_string()));
        }
        let ttl = self.token_ttl_secs.load(Ordering::SeqCst);
        Ok(self.issuer.issue(pub_key, ttl))
    }

    async fn pub_key(&self) -> Result<String, ApiError> {
        self.pub_key_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pub_key.load(Ordering::SeqCst) {
            return Err(ApiError::ServerError("public key unavailable".to_string()));
        }
        Ok(self.issuer.public_key_pem())
    }
}

/// A popup/frame stand-in whose liveness the tests control.
pub struct MockChannel {
    pub url: String,
    pub target: Option<String>,
    pub focused: AtomicBool,
    open: AtomicBool,
}

impl MockChannel {
    fn new(url: &str, target: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            target,
            focused: AtomicBool::new(false),
            open: AtomicBool::new(true),
        })
    }
}

impl LoginChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn focus(&self) {
        self.focused.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Channel host double: records every opened channel and can be told to
/// post the user token automatically whenever a login channel opens.
pub struct MockHost {
    router: Arc<MessageRouter>,
    popups: Mutex<Vec<Arc<MockChannel>>>,
    frames: Mutex<Vec<Arc<MockChannel>>>,
    hidden_frames: Mutex<Vec<Arc<MockChannel>>>,
    auto_token: Mutex<Option<String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            router: Arc::new(MessageRouter::new()),
            popups: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            hidden_frames: Mutex::new(Vec::new()),
            auto_token: Mutex::new(None),
        }
    }

    /// Post `token` back through the router shortly after any login
    /// channel opens, like a provider that immediately completes.
    pub fn with_auto_token(self, token: &str) -> Self {
        *self.auto_token.lock().expect("lock poisoned") = Some(token.to_string());
        self
    }

    pub fn publish(&self, raw: &str) {
        self.router.publish(raw);
    }

    pub fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }

    pub fn popups(&self) -> Vec<Arc<MockChannel>> {
        self.popups.lock().expect("lock poisoned").clone()
    }

    pub fn frames(&self) -> Vec<Arc<MockChannel>> {
        self.frames.lock().expect("lock poisoned").clone()
    }

    pub fn hidden_frames(&self) -> Vec<Arc<MockChannel>> {
        self.hidden_frames.lock().expect("lock poisoned").clone()
    }

    pub async fn wait_for_popup(&self) -> Arc<MockChannel> {
        loop {
            if let Some(channel) = self.popups().pop() {
                return channel;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_frame(&self) -> Arc<MockChannel> {
        loop {
            if let Some(channel) = self.frames().pop() {
                return channel;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn schedule_auto_token(&self, from: &str) {
        let Some(token) = self.auto_token.lock().expect("lock poisoned").clone() else {
            return;
        };
        let router = self.router.clone();
        let message = user_token_message(&token, from);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            router.publish(&message);
        });
    }
}

#[async_trait]
impl ChannelHost for MockHost {
    fn screen(&self) -> ScreenMetrics {
        ScreenMetrics::default()
    }

    async fn open_popup(
        &self,
        url: &str,
        _title: &str,
        _geometry: &PopupGeometry,
    ) -> Result<Arc<dyn LoginChannel>, ChannelError> {
        let channel = MockChannel::new(url, None);
        self.popups.lock().expect("lock poisoned").push(channel.clone());
        self.schedule_auto_token("POPUP");
        Ok(channel)
    }

    async fn open_frame(
        &self,
        url: &str,
        target: &FrameTarget,
    ) -> Result<Arc<dyn LoginChannel>, ChannelError> {
        let channel = MockChannel::new(url, Some(target.id().to_string()));
        self.frames.lock().expect("lock poisoned").push(channel.clone());
        self.schedule_auto_token("FRAME");
        Ok(channel)
    }

    async fn open_hidden_frame(&self, url: &str) -> Result<Arc<dyn LoginChannel>, ChannelError> {
        let channel = MockChannel::new(url, None);
        self.hidden_frames
            .lock()
            .expect("lock poisoned")
            .push(channel.clone());
        Ok(channel)
    }

    fn subscribe(&self) -> MessageSubscription {
        self.router.subscribe()
    }
}

/// In-memory token store with failure switches.
pub struct MemoryStore {
    value: Mutex<Option<String>>,
    fail_load: AtomicBool,
    fail_save: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            fail_load: AtomicBool::new(false),
            fail_save: AtomicBool::new(false),
        }
    }

    pub fn seeded(token: &str) -> Self {
        let store = Self::new();
        *store.value.lock().expect("lock poisoned") = Some(token.to_string());
        store
    }

    /// A store whose every operation fails.
    pub fn failing() -> Self {
        let store = Self::new();
        store.fail_load.store(true, Ordering::SeqCst);
        store.fail_save.store(true, Ordering::SeqCst);
        store
    }

    pub fn value(&self) -> Option<String> {
        self.value.lock().expect("lock poisoned").clone()
    }
}

impl TokenStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, StorageError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("keychain locked".to_string()));
        }
        Ok(self.value())
    }

    fn save(&self, token: &str) -> Result<(), StorageError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("keychain locked".to_string()));
        }
        *self.value.lock().expect("lock poisoned") = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("keychain locked".to_string()));
        }
        *self.value.lock().expect("lock poisoned") = None;
        Ok(())
    }
}
