use thiserror::Error;

use crate::api::ApiError;
use crate::login::ChannelError;

/// Errors surfaced by [`SessionManager`](crate::SessionManager) and
/// [`LoginFlow`](crate::LoginFlow).
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("login window closed before the handshake completed")]
    HandshakeCancelled,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("token exchange failed")]
    TokenExchangeFailed(#[source] ApiError),

    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("durable storage unavailable: {0}")]
    Storage(String),
}
