//! Login handshake driver.
//!
//! A flow opens a popup or frame channel pointed at a one-time login URL
//! and waits for the identity provider to post a `USER_TOKEN` message
//! back. At most one handshake is pending per flow instance: starting a
//! second one while the first is outstanding joins the pending outcome
//! instead of opening another channel.
//!
//! The pending handshake is an explicit state machine:
//!
//! ```text
//! Idle -> Pending{generation} -> Settled{outcome}
//!                ^                    |
//!                +---- reset on rejection
//! ```
//!
//! Resolution comes from the message listener; rejection comes from the
//! liveness watcher, which polls the channel because a cross-origin window
//! can only ever be observed as "still open or not". Rejection resets the
//! machine to `Idle` so the next attempt arms a fresh handshake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::AuthService;
use crate::error::AuthError;

use super::channel::{
    ChannelHost, ChannelMessage, FrameTarget, LoginChannel, MessageSubscription, PopupGeometry,
};

/// Default popup window title
pub const DEFAULT_POPUP_TITLE: &str = "Login";

/// Default popup window width in CSS pixels
pub const DEFAULT_POPUP_WIDTH: u32 = 400;

/// Default popup window height in CSS pixels
pub const DEFAULT_POPUP_HEIGHT: u32 = 600;

/// Why a pending handshake was rejected. Cloneable so one outcome can fan
/// out to every joined waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("login channel closed before the handshake completed")]
    Cancelled,

    #[error("handshake setup failed: {0}")]
    Setup(String),
}

type HandshakeOutcome = Result<String, HandshakeError>;

#[derive(Debug)]
enum HandshakeState {
    Idle,
    Pending {
        generation: u64,
        waiters: Vec<oneshot::Sender<HandshakeOutcome>>,
    },
    Settled {
        outcome: HandshakeOutcome,
    },
}

/// Ticket handed to a caller entering the handshake: either it armed the
/// machine (and must open the channel) or it joined an existing pending
/// attempt.
enum HandshakeTicket {
    Opener {
        generation: u64,
        rx: oneshot::Receiver<HandshakeOutcome>,
    },
    Joiner {
        rx: oneshot::Receiver<HandshakeOutcome>,
    },
}

struct Handshake {
    state: Mutex<HandshakeState>,
    next_generation: AtomicU64,
}

impl Handshake {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::Idle),
            next_generation: AtomicU64::new(1),
        }
    }

    fn begin(&self) -> HandshakeTicket {
        let mut state = self.state.lock().expect("handshake lock poisoned");
        let (tx, rx) = oneshot::channel();

        if let HandshakeState::Pending { waiters, .. } = &mut *state {
            waiters.push(tx);
            return HandshakeTicket::Joiner { rx };
        }
        if let HandshakeState::Settled { outcome } = &*state {
            debug!(previous_ok = outcome.is_ok(), "re-arming after a settled handshake");
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        *state = HandshakeState::Pending {
            generation,
            waiters: vec![tx],
        };
        HandshakeTicket::Opener { generation, rx }
    }

    fn pending_generation(&self) -> Option<u64> {
        match *self.state.lock().expect("handshake lock poisoned") {
            HandshakeState::Pending { generation, .. } => Some(generation),
            _ => None,
        }
    }

    /// Resolve the pending handshake with a user token. Ignored when
    /// nothing is pending (unsolicited or late message).
    fn resolve(&self, token: String) {
        let mut state = self.state.lock().expect("handshake lock poisoned");
        if let HandshakeState::Pending { waiters, .. } = &mut *state {
            for tx in waiters.drain(..) {
                let _ = tx.send(Ok(token.clone()));
            }
            *state = HandshakeState::Settled {
                outcome: Ok(token),
            };
        } else {
            debug!("token message with no pending handshake, ignoring");
        }
    }

    /// Reject the pending handshake of `generation`, then reset to `Idle`
    /// so the next attempt starts fresh. Returns false for a stale
    /// generation (already settled or superseded).
    fn reject(&self, generation: u64, error: HandshakeError) -> bool {
        let mut state = self.state.lock().expect("handshake lock poisoned");
        match &mut *state {
            HandshakeState::Pending {
                generation: pending,
                waiters,
            } if *pending == generation => {
                for tx in waiters.drain(..) {
                    let _ = tx.send(Err(error.clone()));
                }
                *state = HandshakeState::Idle;
                true
            }
            _ => false,
        }
    }
}

struct FlowInner {
    api: Arc<dyn AuthService>,
    host: Arc<dyn ChannelHost>,
    poll_interval: Duration,
    handshake: Handshake,
    login_channel: Mutex<Option<Arc<dyn LoginChannel>>>,
    logout_channel: Mutex<Option<Arc<dyn LoginChannel>>>,
}

impl FlowInner {
    fn route(&self, raw: &str) {
        let Ok(message) = serde_json::from_str::<ChannelMessage>(raw) else {
            debug!("ignoring unrecognized channel message");
            return;
        };

        match message {
            ChannelMessage::UserToken { token, from } => {
                debug!(from = ?from, "user token received, tearing down login channel");
                if let Some(channel) = self
                    .login_channel
                    .lock()
                    .expect("channel lock poisoned")
                    .take()
                {
                    channel.close();
                }
                self.handshake.resolve(token);
            }
            ChannelMessage::Logout => {
                debug!("logout acknowledged, removing logout frame");
                if let Some(channel) = self
                    .logout_channel
                    .lock()
                    .expect("channel lock poisoned")
                    .take()
                {
                    channel.close();
                }
            }
        }
    }
}

/// Drives the popup/frame login handshake and the headless logout ping.
///
/// Only one live flow should consume a host's message stream at a time;
/// two flows would double-handle every inbound message.
pub struct LoginFlow {
    inner: Arc<FlowInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl LoginFlow {
    pub fn new(
        api: Arc<dyn AuthService>,
        host: Arc<dyn ChannelHost>,
        poll_interval: Duration,
    ) -> Self {
        let inner = Arc::new(FlowInner {
            api,
            host,
            poll_interval,
            handshake: Handshake::new(),
            login_channel: Mutex::new(None),
            logout_channel: Mutex::new(None),
        });

        // Subscribe before spawning so no message published after
        // construction can be missed.
        let subscription = inner.host.subscribe();
        let listener = tokio::spawn(Self::listen(Arc::downgrade(&inner), subscription));

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    async fn listen(weak: Weak<FlowInner>, mut subscription: MessageSubscription) {
        while let Some(raw) = subscription.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            inner.route(&raw);
        }
    }

    /// Run the handshake through a centred popup channel.
    pub async fn from_popup(
        &self,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<String, AuthError> {
        let rx = match self.inner.handshake.begin() {
            HandshakeTicket::Joiner { rx } => {
                debug!("handshake already pending, joining");
                rx
            }
            HandshakeTicket::Opener { generation, rx } => {
                self.open_popup_channel(generation, title, width, height)
                    .await?;
                rx
            }
        };
        Self::await_outcome(rx).await
    }

    /// Run the handshake through a frame injected into `target`.
    pub async fn from_frame(&self, target: &FrameTarget) -> Result<String, AuthError> {
        let rx = match self.inner.handshake.begin() {
            HandshakeTicket::Joiner { rx } => {
                debug!("handshake already pending, joining");
                rx
            }
            HandshakeTicket::Opener { generation, rx } => {
                self.open_frame_channel(generation, target).await?;
                rx
            }
        };
        Self::await_outcome(rx).await
    }

    async fn open_popup_channel(
        &self,
        generation: u64,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<(), AuthError> {
        let inner = &self.inner;
        let urls = match inner.api.auth().await {
            Ok(urls) => urls,
            Err(e) => {
                inner
                    .handshake
                    .reject(generation, HandshakeError::Setup(e.to_string()));
                return Err(e.into());
            }
        };

        let geometry = PopupGeometry::centered(width, height, &inner.host.screen());
        let channel = match inner.host.open_popup(&urls.login_url, title, &geometry).await {
            Ok(channel) => channel,
            Err(e) => {
                inner
                    .handshake
                    .reject(generation, HandshakeError::Setup(e.to_string()));
                return Err(e.into());
            }
        };
        channel.focus();

        *inner.login_channel.lock().expect("channel lock poisoned") = Some(channel.clone());
        spawn_liveness_watcher(inner, generation, channel);
        Ok(())
    }

    async fn open_frame_channel(
        &self,
        generation: u64,
        target: &FrameTarget,
    ) -> Result<(), AuthError> {
        let inner = &self.inner;
        let urls = match inner.api.auth().await {
            Ok(urls) => urls,
            Err(e) => {
                inner
                    .handshake
                    .reject(generation, HandshakeError::Setup(e.to_string()));
                return Err(e.into());
            }
        };

        let channel = match inner.host.open_frame(&urls.login_url, target).await {
            Ok(channel) => channel,
            Err(e) => {
                inner
                    .handshake
                    .reject(generation, HandshakeError::Setup(e.to_string()));
                return Err(e.into());
            }
        };

        *inner.login_channel.lock().expect("channel lock poisoned") = Some(channel.clone());
        spawn_liveness_watcher(inner, generation, channel);
        Ok(())
    }

    async fn await_outcome(rx: oneshot::Receiver<HandshakeOutcome>) -> Result<String, AuthError> {
        match rx.await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(HandshakeError::Cancelled)) => Err(AuthError::HandshakeCancelled),
            Ok(Err(HandshakeError::Setup(message))) => Err(AuthError::HandshakeFailed(message)),
            // Sender dropped without settling; the flow is being torn down.
            Err(_) => Err(AuthError::HandshakeCancelled),
        }
    }

    /// Ping the provider's logout URL through a hidden frame channel. The
    /// frame is removed asynchronously when the acknowledgement message
    /// arrives. A no-op while a logout frame is already present.
    pub async fn logout(&self) -> Result<(), AuthError> {
        if self
            .inner
            .logout_channel
            .lock()
            .expect("channel lock poisoned")
            .is_some()
        {
            return Ok(());
        }

        let urls = self.inner.api.auth().await?;
        let channel = self.inner.host.open_hidden_frame(&urls.logout_url).await?;
        *self
            .inner
            .logout_channel
            .lock()
            .expect("channel lock poisoned") = Some(channel);
        Ok(())
    }

    /// Stop the message listener and release its subscription. Idempotent;
    /// also run on drop.
    pub fn dispose(&self) {
        if let Some(handle) = self.listener.lock().expect("listener lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for LoginFlow {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Poll the channel until it reports closed (reject the handshake) or the
/// handshake settles by other means (stop quietly).
fn spawn_liveness_watcher(
    inner: &Arc<FlowInner>,
    generation: u64,
    channel: Arc<dyn LoginChannel>,
) {
    let weak = Arc::downgrade(inner);
    let poll_interval = inner.poll_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { return };

            if inner.handshake.pending_generation() != Some(generation) {
                return;
            }
            if !channel.is_open() {
                if inner.handshake.reject(generation, HandshakeError::Cancelled) {
                    warn!("login channel closed before the handshake completed");
                    inner
                        .login_channel
                        .lock()
                        .expect("channel lock poisoned")
                        .take();
                }
                return;
            }
        }
    });
}
