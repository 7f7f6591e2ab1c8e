//! Relay state records for in-flight SAML logins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relay state token (16-byte random value, hex-encoded on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayToken([u8; 16]);

impl RelayToken {
    /// Generate a new random token.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Hex form sent to the IdP as `RelayState`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex. Anything but exactly 16 bytes is rejected.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for RelayToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RelayToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// What was remembered when a login was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub token: RelayToken,

    /// Provider the login was started against.
    pub provider_id: String,

    /// Where the client wants the token delivered.
    pub callback_url: Option<String>,

    /// AuthnRequest ID, for matching `InResponseTo`.
    pub request_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RelayState {
    pub fn new(provider_id: impl Into<String>, callback_url: Option<String>, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            token: RelayToken::new(),
            provider_id: provider_id.into(),
            callback_url,
            request_id: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}
