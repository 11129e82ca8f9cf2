//! Durable storage for the user token.
//!
//! One fixed key-value entry: present means a user token survives process
//! restarts, absent means logged out. The production store keeps the token
//! in the OS keychain. Storage failures are degraded, never fatal - a
//! session that cannot reach storage simply behaves as logged out.

use keyring::Entry;
use thiserror::Error;

/// Keychain service name
const KEYRING_SERVICE: &str = "authlink";

/// Fixed account name for the single user-token entry
const USER_TOKEN_KEY: &str = "user-token";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable store seam for the user token.
pub trait TokenStore: Send + Sync {
    /// Load the persisted user token, `None` when absent.
    fn load(&self) -> Result<Option<String>, StorageError>;

    /// Persist the user token under the fixed key.
    fn save(&self, token: &str) -> Result<(), StorageError>;

    /// Remove the persisted user token.
    fn clear(&self) -> Result<(), StorageError>;
}

/// OS keychain implementation.
pub struct KeyringStore {
    entry: Entry,
}

impl KeyringStore {
    pub fn new() -> Result<Self, StorageError> {
        let entry = Entry::new(KEYRING_SERVICE, USER_TOKEN_KEY)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self { entry })
    }
}

impl TokenStore for KeyringStore {
    fn load(&self) -> Result<Option<String>, StorageError> {
        match self.entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }

    fn save(&self, token: &str) -> Result<(), StorageError> {
        self.entry
            .set_password(token)
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    fn clear(&self) -> Result<(), StorageError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }
}
