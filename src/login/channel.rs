//! Channel capability layer for the login handshake.
//!
//! The handshake runs over host-provided "channels" - the popup window and
//! frame analogues of the browser flow. The host supplies two capabilities
//! behind traits: opening channels ([`ChannelHost`]) and reporting whether
//! a channel is still open ([`LoginChannel::is_open`]). Cross-origin
//! isolation means closure can only ever be observed by polling, so
//! liveness is a poll, not a notification; non-browser hosts may back it
//! with any heartbeat they have.
//!
//! Inbound messages arrive as JSON text through a [`MessageSubscription`]
//! obtained from the host; [`MessageRouter`] is a fan-out helper hosts can
//! embed to implement it.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// Where a token message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelOrigin {
    Popup,
    Frame,
}

/// Wire message delivered over the cross-channel transport.
///
/// Anything that fails to parse into one of these shapes is ignored by the
/// flow's listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    /// The provider completed the handshake and posted the user token.
    #[serde(rename = "USER_TOKEN")]
    UserToken {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ChannelOrigin>,
    },
    /// The provider acknowledged the logout ping.
    #[serde(rename = "LOGOUT")]
    Logout,
}

/// Identifies the host container a login frame is injected into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTarget(String);

impl FrameTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Host screen metrics used to centre the login popup.
#[derive(Debug, Clone, Copy)]
pub struct ScreenMetrics {
    pub screen_left: f64,
    pub screen_top: f64,
    pub window_width: f64,
    pub window_height: f64,
    pub avail_width: f64,
}

impl Default for ScreenMetrics {
    fn default() -> Self {
        Self {
            screen_left: 0.0,
            screen_top: 0.0,
            window_width: 1280.0,
            window_height: 800.0,
            avail_width: 1280.0,
        }
    }
}

/// Placement of a popup channel, zoom-compensated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopupGeometry {
    pub width: f64,
    pub height: f64,
    pub left: f64,
    pub top: f64,
}

impl PopupGeometry {
    /// Centre a `width` x `height` popup on the host window, compensating
    /// for display zoom the way browsers report it (window width relative
    /// to available screen width).
    pub fn centered(width: u32, height: u32, screen: &ScreenMetrics) -> Self {
        let system_zoom = if screen.avail_width > 0.0 {
            screen.window_width / screen.avail_width
        } else {
            1.0
        };
        let width = f64::from(width);
        let height = f64::from(height);

        Self {
            width: width / system_zoom,
            height: height / system_zoom,
            left: (screen.window_width - width) / 2.0 / system_zoom + screen.screen_left,
            top: (screen.window_height - height) / 2.0 / system_zoom + screen.screen_top,
        }
    }
}

/// An open popup or frame channel.
pub trait LoginChannel: Send + Sync {
    /// Whether the underlying window/frame is still open. Polled by the
    /// liveness watcher; the only closure signal available cross-origin.
    fn is_open(&self) -> bool;

    /// Bring the channel to the foreground, where that means anything.
    fn focus(&self) {}

    /// Close the window / remove the frame.
    fn close(&self);
}

/// Capability interface the host supplies for opening channels and
/// delivering inbound messages.
#[async_trait]
pub trait ChannelHost: Send + Sync {
    /// Current screen metrics, for popup placement.
    fn screen(&self) -> ScreenMetrics;

    /// Open a popup channel at the given URL and placement.
    async fn open_popup(
        &self,
        url: &str,
        title: &str,
        geometry: &PopupGeometry,
    ) -> Result<Arc<dyn LoginChannel>, ChannelError>;

    /// Clear the target container and inject a full-size frame channel
    /// pointed at the URL.
    async fn open_frame(
        &self,
        url: &str,
        target: &FrameTarget,
    ) -> Result<Arc<dyn LoginChannel>, ChannelError>;

    /// Inject an invisible frame channel (the logout side-channel).
    async fn open_hidden_frame(&self, url: &str) -> Result<Arc<dyn LoginChannel>, ChannelError>;

    /// Subscribe to inbound cross-channel messages. The subscription is
    /// released when the returned handle is dropped.
    fn subscribe(&self) -> MessageSubscription;
}

/// Per-instance handle on the host's inbound message stream.
pub struct MessageSubscription {
    rx: mpsc::UnboundedReceiver<String>,
}

impl MessageSubscription {
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Next raw message, `None` once the host side shuts down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Fan-out helper for hosts: every subscriber receives every published
/// message. Dropped subscriptions are pruned on the next publish.
#[derive(Default)]
pub struct MessageRouter {
    senders: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> MessageSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("router lock poisoned").push(tx);
        MessageSubscription::from_receiver(rx)
    }

    pub fn publish(&self, raw: &str) {
        self.senders
            .lock()
            .expect("router lock poisoned")
            .retain(|tx| tx.send(raw.to_string()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut senders = self.senders.lock().expect("router lock poisoned");
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_round_trip() {
        let raw = r#"{"type": "USER_TOKEN", "token": "utok-1", "from": "POPUP"}"#;
        let parsed: ChannelMessage = serde_json::from_str(raw).expect("Failed to parse");
        assert_eq!(
            parsed,
            ChannelMessage::UserToken {
                token: "utok-1".to_string(),
                from: Some(ChannelOrigin::Popup),
            }
        );

        let logout: ChannelMessage =
            serde_json::from_str(r#"{"type": "LOGOUT"}"#).expect("Failed to parse");
        assert_eq!(logout, ChannelMessage::Logout);
    }

    #[test]
    fn test_wire_message_from_tag_is_optional() {
        let raw = r#"{"type": "USER_TOKEN", "token": "utok-1"}"#;
        let parsed: ChannelMessage = serde_json::from_str(raw).expect("Failed to parse");
        assert_eq!(
            parsed,
            ChannelMessage::UserToken {
                token: "utok-1".to_string(),
                from: None,
            }
        );
    }

    #[test]
    fn test_unknown_or_malformed_messages_do_not_parse() {
        assert!(serde_json::from_str::<ChannelMessage>(r#"{"type": "PING"}"#).is_err());
        assert!(serde_json::from_str::<ChannelMessage>(r#"{"type": "USER_TOKEN"}"#).is_err());
        assert!(serde_json::from_str::<ChannelMessage>("not json").is_err());
    }

    #[test]
    fn test_centered_geometry_no_zoom() {
        let screen = ScreenMetrics {
            screen_left: 0.0,
            screen_top: 0.0,
            window_width: 1600.0,
            window_height: 900.0,
            avail_width: 1600.0,
        };
        let g = PopupGeometry::centered(400, 600, &screen);
        assert_eq!(g.width, 400.0);
        assert_eq!(g.height, 600.0);
        assert_eq!(g.left, 600.0);
        assert_eq!(g.top, 150.0);
    }

    #[test]
    fn test_centered_geometry_compensates_zoom() {
        // Window reports double the available width: 2x zoom.
        let screen = ScreenMetrics {
            screen_left: 100.0,
            screen_top: 50.0,
            window_width: 1600.0,
            window_height: 900.0,
            avail_width: 800.0,
        };
        let g = PopupGeometry::centered(400, 600, &screen);
        assert_eq!(g.width, 200.0);
        assert_eq!(g.height, 300.0);
        assert_eq!(g.left, 300.0 + 100.0);
        assert_eq!(g.top, 75.0 + 50.0);
    }

    #[test]
    fn test_centered_geometry_zero_avail_width() {
        let screen = ScreenMetrics {
            avail_width: 0.0,
            ..ScreenMetrics::default()
        };
        // Degenerate metrics fall back to zoom 1 instead of dividing by zero.
        let g = PopupGeometry::centered(400, 600, &screen);
        assert_eq!(g.width, 400.0);
    }

    #[tokio::test]
    async fn test_router_fan_out_and_pruning() {
        let router = MessageRouter::new();
        let mut a = router.subscribe();
        let mut b = router.subscribe();
        assert_eq!(router.subscriber_count(), 2);

        router.publish("hello");
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));

        drop(a);
        router.publish("again");
        assert_eq!(b.recv().await.as_deref(), Some("again"));
        assert_eq!(router.subscriber_count(), 1);
    }
}
