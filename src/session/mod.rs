//! Session management module.
//!
//! This module provides:
//! - `SessionManager`: login/logout, access token lifecycle, request signing
//! - `EphemeralKey`: TTL-bound local signing keypair
//! - `TokenVerifier` / `JwtVerifier`: access token decode and verification
//! - `TokenStore` / `KeyringStore`: the durable user-token entry

pub mod keys;
pub mod manager;
pub mod storage;
pub mod token;

pub use keys::{
    EphemeralKey, SignableMessage, ACCESS_TOKEN_HEADER, EPHEMERAL_KEY_HEADER, SIGNATURE_HEADER,
};
pub use manager::SessionManager;
pub use storage::{KeyringStore, StorageError, TokenStore};
pub use token::{AccessClaims, JwtVerifier, TokenError, TokenVerifier};
