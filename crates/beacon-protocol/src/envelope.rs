//! The envelope: Beacon's universal message format.
//!
//! Routers only look at `to`, `from`, `type` and `expires_at`; the body is
//! an opaque map owned by the application.

use crate::address::{Address, AddressError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Envelope format version written into every envelope.
pub const UMF_VERSION: &str = "UMF/1.0";

/// Prefix shared by every compatible version string.
const UMF_MAJOR_PREFIX: &str = "UMF/1.";

/// Application payload carried by an envelope.
pub type Body = serde_json::Map<String, serde_json::Value>;

/// A unique envelope identifier.
pub type EnvelopeId = String;

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch, from the wall clock.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A routable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Unique envelope identifier.
    pub id: EnvelopeId,
    /// Destination address.
    pub to: String,
    /// Origin address.
    pub from: String,
    /// Application-level dispatch tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
    /// Time after which the recipient must treat the envelope as invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Opaque application payload.
    #[serde(default)]
    pub body: Body,
}

fn default_version() -> String {
    UMF_VERSION.to_string()
}

impl Envelope {
    /// Create a new envelope stamped with the wall clock.
    #[must_use]
    pub fn new(to: &Address, from: &Address, message_type: impl Into<String>, body: Body) -> Self {
        Self::new_at(to, from, message_type, body, unix_millis())
    }

    /// Create a new envelope stamped with the given time.
    #[must_use]
    pub fn new_at(
        to: &Address,
        from: &Address,
        message_type: impl Into<String>,
        body: Body,
        timestamp: u64,
    ) -> Self {
        Self {
            version: default_version(),
            id: generate_envelope_id(),
            to: to.to_string(),
            from: from.to_string(),
            message_type: message_type.into(),
            timestamp,
            expires_at: None,
            body,
        }
    }

    /// Expire the envelope `ttl` after its creation time.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.timestamp.saturating_add(ttl.as_millis() as u64));
        self
    }

    /// Expire the envelope at an absolute time.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: Option<u64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Keep a caller-supplied identifier instead of the generated one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EnvelopeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Check if the envelope has expired at `now` (milliseconds since epoch).
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Parse the destination address.
    ///
    /// # Errors
    ///
    /// Returns an error if `to` is malformed.
    pub fn to_address(&self) -> Result<Address, AddressError> {
        Address::parse(&self.to)
    }

    /// Parse the origin address.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` is malformed.
    pub fn from_address(&self) -> Result<Address, AddressError> {
        Address::parse(&self.from)
    }

    /// Check both addresses against the grammar.
    ///
    /// # Errors
    ///
    /// Returns the first malformed address found.
    pub fn validate(&self) -> Result<(), AddressError> {
        self.to_address()?;
        self.from_address()?;
        Ok(())
    }

    /// Check if the version is readable by this implementation.
    #[must_use]
    pub fn is_supported_version(&self) -> bool {
        self.version.starts_with(UMF_MAJOR_PREFIX)
    }

    /// Read a string field from the body.
    #[must_use]
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(serde_json::Value::as_str)
    }
}
