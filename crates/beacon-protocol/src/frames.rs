//! Frame types for the store wire protocol.
//!
//! Frames are exchanged between a remote store client and the store
//! server. Requests carry an `id` that the matching reply echoes back;
//! `Message` frames are pushed by the server for active subscriptions.

use serde::{Deserialize, Serialize};

/// Error code: the frame could not be decoded or is not a request.
pub const ERROR_INVALID_FRAME: u16 = 1001;

/// Error code: the backing store rejected the operation.
pub const ERROR_STORE: u16 = 1002;

/// Error code: the request kind is not supported.
pub const ERROR_UNKNOWN_REQUEST: u16 = 1003;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Set = 0x01,
    Get = 0x02,
    Scan = 0x03,
    Del = 0x04,
    Publish = 0x05,
    Subscribe = 0x06,
    Unsubscribe = 0x07,
    Ok = 0x10,
    Value = 0x11,
    Keys = 0x12,
    Count = 0x13,
    Message = 0x14,
    Error = 0x15,
    Ping = 0x20,
    Pong = 0x21,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Set),
            0x02 => Ok(FrameType::Get),
            0x03 => Ok(FrameType::Scan),
            0x04 => Ok(FrameType::Del),
            0x05 => Ok(FrameType::Publish),
            0x06 => Ok(FrameType::Subscribe),
            0x07 => Ok(FrameType::Unsubscribe),
            0x10 => Ok(FrameType::Ok),
            0x11 => Ok(FrameType::Value),
            0x12 => Ok(FrameType::Keys),
            0x13 => Ok(FrameType::Count),
            0x14 => Ok(FrameType::Message),
            0x15 => Ok(FrameType::Error),
            0x20 => Ok(FrameType::Ping),
            0x21 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Store a value under a key with an expiry.
    #[serde(rename = "set")]
    Set {
        /// Request ID.
        id: u64,
        /// Key to write.
        key: String,
        /// Value bytes.
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
        /// Time-to-live in milliseconds.
        ttl_ms: u64,
    },

    /// Read the value of a key.
    #[serde(rename = "get")]
    Get {
        /// Request ID.
        id: u64,
        /// Key to read.
        key: String,
    },

    /// List live keys starting with a prefix.
    #[serde(rename = "scan")]
    Scan {
        /// Request ID.
        id: u64,
        /// Key prefix.
        prefix: String,
    },

    /// Delete a key.
    #[serde(rename = "del")]
    Del {
        /// Request ID.
        id: u64,
        /// Key to delete.
        key: String,
    },

    /// Publish a payload on a pub/sub channel.
    #[serde(rename = "publish")]
    Publish {
        /// Request ID.
        id: u64,
        /// Target channel.
        channel: String,
        /// Message payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Start receiving messages from a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID.
        id: u64,
        /// Channel name.
        channel: String,
    },

    /// Stop receiving messages from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID.
        id: u64,
        /// Channel name.
        channel: String,
    },

    /// Request succeeded with nothing to return.
    #[serde(rename = "ok")]
    Ok {
        /// ID of the completed request.
        id: u64,
    },

    /// Reply to `Get`.
    #[serde(rename = "value")]
    Value {
        /// ID of the completed request.
        id: u64,
        /// The value, if the key is live.
        #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
        value: Option<Vec<u8>>,
    },

    /// Reply to `Scan`.
    #[serde(rename = "keys")]
    Keys {
        /// ID of the completed request.
        id: u64,
        /// Matching keys in first-insertion order.
        keys: Vec<String>,
    },

    /// Reply to `Del` (keys removed) and `Publish` (receivers reached).
    #[serde(rename = "count")]
    Count {
        /// ID of the completed request.
        id: u64,
        /// Count result.
        count: u64,
    },

    /// Message pushed to a subscriber.
    #[serde(rename = "message")]
    Message {
        /// Channel the message was published on.
        channel: String,
        /// Message payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Set { .. } => FrameType::Set,
            Frame::Get { .. } => FrameType::Get,
            Frame::Scan { .. } => FrameType::Scan,
            Frame::Del { .. } => FrameType::Del,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Ok { .. } => FrameType::Ok,
            Frame::Value { .. } => FrameType::Value,
            Frame::Keys { .. } => FrameType::Keys,
            Frame::Count { .. } => FrameType::Count,
            Frame::Message { .. } => FrameType::Message,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// The request ID a request carries or a reply answers.
    ///
    /// Returns `None` for pushes and keepalives.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Set { id, .. }
            | Frame::Get { id, .. }
            | Frame::Scan { id, .. }
            | Frame::Del { id, .. }
            | Frame::Publish { id, .. }
            | Frame::Subscribe { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::Ok { id }
            | Frame::Value { id, .. }
            | Frame::Keys { id, .. }
            | Frame::Count { id, .. }
            | Frame::Error { id, .. } => Some(*id),
            Frame::Message { .. } | Frame::Ping { .. } | Frame::Pong { .. } => None,
        }
    }

    /// Check if this frame is a reply to a request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Frame::Ok { .. }
                | Frame::Value { .. }
                | Frame::Keys { .. }
                | Frame::Count { .. }
                | Frame::Error { .. }
        )
    }

    /// Create a new Set frame.
    #[must_use]
    pub fn set(id: u64, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl_ms: u64) -> Self {
        Frame::Set {
            id,
            key: key.into(),
            value: value.into(),
            ttl_ms,
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(id: u64, channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Message push frame.
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Ok frame.
    #[must_use]
    pub fn ok(id: u64) -> Self {
        Frame::Ok { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let set = Frame::set(1, "k", b"v".to_vec(), 1000);
        assert_eq!(set.frame_type(), FrameType::Set);

        let push = Frame::message("inbox", b"hello".to_vec());
        assert_eq!(push.frame_type(), FrameType::Message);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01), Ok(FrameType::Set));
        assert_eq!(FrameType::try_from(0x14), Ok(FrameType::Message));
        assert_eq!(u8::from(FrameType::Pong), 0x21);
        assert!(FrameType::try_from(0x99).is_err());
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::ok(7).request_id(), Some(7));
        assert_eq!(Frame::Scan { id: 3, prefix: "p".into() }.request_id(), Some(3));
        assert_eq!(Frame::message("c", Vec::new()).request_id(), None);
        assert_eq!(Frame::ping().request_id(), None);
    }

    #[test]
    fn test_is_reply() {
        assert!(Frame::ok(1).is_reply());
        assert!(Frame::error(1, ERROR_STORE, "down").is_reply());
        assert!(!Frame::publish(1, "c", Vec::new()).is_reply());
        assert!(!Frame::message("c", Vec::new()).is_reply());
    }
}
