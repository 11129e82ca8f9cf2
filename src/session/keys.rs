//! Ephemeral signing keypair and credential header production.
//!
//! Each session owns a locally generated Ed25519 keypair with a TTL. Its
//! public half (hex) is submitted when minting access tokens so the service
//! can bind the token to this key; its private half signs the canonical
//! bytes of every outbound request. The keypair never leaves the process.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

/// Header carrying the short-lived access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Header carrying the ephemeral public key (hex).
pub const EPHEMERAL_KEY_HEADER: &str = "x-ephemeral-key";

/// Header carrying the hex Ed25519 signature over the canonical bytes.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Canonical descriptor of a payload to be signed: either a normalized
/// HTTP request or an opaque application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignableMessage {
    Request {
        method: String,
        url: String,
        body: Option<Vec<u8>>,
    },
    Message {
        body: Option<Vec<u8>>,
    },
}

impl SignableMessage {
    pub fn from_request(method: &str, url: &str, body: Option<&[u8]>) -> Self {
        Self::Request {
            method: method.to_uppercase(),
            url: url.to_string(),
            body: body.map(|b| b.to_vec()),
        }
    }

    pub fn from_message(body: Option<&[u8]>) -> Self {
        Self::Message {
            body: body.map(|b| b.to_vec()),
        }
    }

    /// Canonical byte representation fed to the signer. Method and URL are
    /// newline-delimited; neither may contain a newline, so the encoding is
    /// unambiguous for any body.
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Self::Request { method, url, body } => {
                let mut bytes = format!("{}\n{}\n", method, url).into_bytes();
                if let Some(body) = body {
                    bytes.extend_from_slice(body);
                }
                bytes
            }
            Self::Message { body } => body.clone().unwrap_or_default(),
        }
    }
}

/// Locally generated Ed25519 keypair with a TTL.
pub struct EphemeralKey {
    signing_key: SigningKey,
    public_key_hex: String,
    expires_at: DateTime<Utc>,
}

impl EphemeralKey {
    /// Generate a fresh keypair valid for `ttl`.
    pub fn generate(ttl: Duration) -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(chrono::Duration::milliseconds(ttl_ms))
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

        Self {
            signing_key,
            public_key_hex,
            expires_at,
        }
    }

    pub fn has_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Hex-encoded public half, as submitted to the token exchange.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Produce the authentication headers for `input` under `access_token`.
    ///
    /// Deterministic: the same input, token and keypair always yield the
    /// same headers. The signature covers the canonical bytes and the
    /// access token, so a signature cannot be replayed under another token.
    pub fn make_credentials(
        &self,
        input: &SignableMessage,
        access_token: &str,
    ) -> BTreeMap<String, String> {
        let mut payload = input.canonical_bytes();
        payload.push(b'\n');
        payload.extend_from_slice(access_token.as_bytes());

        let signature = self.signing_key.sign(&payload);

        let mut headers = BTreeMap::new();
        headers.insert(ACCESS_TOKEN_HEADER.to_string(), access_token.to_string());
        headers.insert(EPHEMERAL_KEY_HEADER.to_string(), self.public_key_hex.clone());
        headers.insert(SIGNATURE_HEADER.to_string(), hex::encode(signature.to_bytes()));
        headers
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public_key_hex", &self.public_key_hex)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
