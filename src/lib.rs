//! authlink - client-side authenticated session management.
//!
//! A session is established through a cross-channel handshake: the host
//! opens a popup or frame pointed at a one-time login URL, the identity
//! provider posts an opaque user token back, and the manager exchanges it
//! (together with a locally generated ephemeral public key) for a
//! short-lived signed access token. The access token is cached, verified
//! before reuse, renewed in the background before expiry, and used to sign
//! per-request authentication headers.
//!
//! Hosts supply the environment-specific pieces behind small traits:
//! opening channels and reporting their liveness ([`ChannelHost`],
//! [`LoginChannel`]) and, optionally, storage and verification overrides.

mod config;
mod error;

pub mod api;
pub mod login;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, AuthClient, AuthService, AuthUrls};
pub use config::AuthOptions;
pub use error::AuthError;
pub use login::{
    ChannelError, ChannelHost, ChannelMessage, ChannelOrigin, FrameTarget, LoginChannel,
    LoginFlow, MessageRouter, MessageSubscription, PopupGeometry, ScreenMetrics,
};
pub use session::{
    AccessClaims, EphemeralKey, JwtVerifier, KeyringStore, SessionManager, SignableMessage,
    StorageError, TokenStore, TokenVerifier,
};
