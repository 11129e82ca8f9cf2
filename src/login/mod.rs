//! Login handshake module.
//!
//! This module provides:
//! - `LoginFlow`: the popup/frame handshake driver and logout side-channel
//! - the channel capability traits a host implements (`ChannelHost`,
//!   `LoginChannel`) and the message routing helpers
//!
//! The handshake is resolved by cross-channel messages and cancelled by
//! polling channel liveness; see `flow` for the state machine.

pub mod channel;
pub mod flow;

pub use channel::{
    ChannelError, ChannelHost, ChannelMessage, ChannelOrigin, FrameTarget, LoginChannel,
    MessageRouter, MessageSubscription, PopupGeometry, ScreenMetrics,
};
pub use flow::{
    HandshakeError, LoginFlow, DEFAULT_POPUP_HEIGHT, DEFAULT_POPUP_TITLE, DEFAULT_POPUP_WIDTH,
};
