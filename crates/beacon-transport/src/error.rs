//! Transport errors.

use beacon_core::StoreError;
use beacon_protocol::frames::{FrameType, ERROR_STORE};
use beacon_protocol::ProtocolError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No reply arrived in time.
    #[error("Request timed out")]
    Timeout,

    /// The WebSocket handshake failed.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server answered with an error frame.
    #[error("Server error {code}: {message}")]
    Remote {
        /// Error code.
        code: u16,
        /// Server message.
        message: String,
    },

    /// The server answered with the wrong kind of frame.
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(FrameType),
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => StoreError::Closed,
            TransportError::Protocol(e) => StoreError::Encoding(e.to_string()),
            TransportError::Remote { code, message } if code == ERROR_STORE => {
                StoreError::Unavailable(message)
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
