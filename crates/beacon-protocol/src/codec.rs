//! Codec for encoding and decoding Beacon frames and envelopes.
//!
//! Store frames use MessagePack with length-prefixed framing. Envelopes
//! travel as pub/sub payloads, so they are plain MessagePack documents.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::address::AddressError;
use crate::envelope::Envelope;
use crate::frames::Frame;

/// Largest frame payload accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Bytes in the big-endian length header.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors raised while framing or parsing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame payload is over [`MAX_FRAME_SIZE`].
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// The buffer ends before the frame does.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// Serialization failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Payload is not a valid document.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Envelope carries a malformed address.
    #[error("Invalid envelope: {0}")]
    Address(#[from] AddressError),

    /// Envelope was written by an incompatible version.
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(String),
}

/// Serialize a frame behind a 4-byte big-endian length header.
///
/// # Errors
///
/// Fails if serialization fails or the payload is over [`MAX_FRAME_SIZE`].
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append one framed frame to `buf`.
///
/// # Errors
///
/// Same as [`encode`].
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Parse exactly one frame from the start of `data`.
///
/// # Errors
///
/// Fails on a short buffer, an oversized length header, or a bad payload.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let length = read_length(data)?;

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Pop the next complete frame off a streaming buffer.
///
/// `Ok(None)` means the buffer holds only part of a frame and is left
/// untouched.
///
/// # Errors
///
/// Fails on an oversized length header or a bad payload.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let length = match read_length(buf) {
        Ok(length) => length,
        Err(ProtocolError::Incomplete(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

fn read_length(data: &[u8]) -> Result<usize, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}

/// Encode an envelope as a pub/sub payload.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;
    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }
    Ok(Bytes::from(payload))
}

/// Decode and validate an envelope received on a channel.
///
/// # Errors
///
/// Returns an error if the payload is not an envelope, was written by an
/// incompatible version, or carries a malformed address.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }
    let envelope: Envelope = rmp_serde::from_slice(data)?;
    if !envelope.is_supported_version() {
        return Err(ProtocolError::UnsupportedVersion(envelope.version));
    }
    envelope.validate()?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::envelope::Body;
    use serde_json::json;
    use std::time::Duration;

    fn token() -> Envelope {
        let mut body = Body::new();
        body.insert("passes".to_string(), json!(3));
        body.insert("trail".to_string(), json!(["a", "b"]));
        Envelope::new(
            &Address::service("hpp", "/"),
            &Address::instance("a", "hpp", "/"),
            "hotpotato",
            body,
        )
        .with_ttl(Duration::from_secs(30))
    }

    #[test]
    fn test_encode_decode_frames() {
        let frames = vec![
            Frame::set(1, "beacon:presence:hpp:a", b"{}".to_vec(), 10_000),
            Frame::Value { id: 2, value: None },
            Frame::Value { id: 3, value: Some(b"x".to_vec()) },
            Frame::Keys { id: 4, keys: vec!["a".into(), "b".into()] },
            Frame::message("beacon:inbox:a", b"payload".to_vec()),
            Frame::error(5, 1002, "store down"),
            Frame::ping(),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::Get { id: 1, key: "test".into() };
        let encoded = encode(&frame).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("short buffer decoded as {other:?}"),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::publish(1, "test", vec![0u8; MAX_FRAME_SIZE + 1]);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("oversized frame encoded as {other:?}"),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::Subscribe { id: 1, channel: "c1".into() };
        let frame2 = Frame::Unsubscribe { id: 2, channel: "c1".into() };

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // Partial prefix is not an error.
        let mut partial = BytesMut::from(&buf[..2]);
        assert!(decode_from(&mut partial).unwrap().is_none());

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_envelope_payload() {
        let envelope = token();
        let encoded = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.body["trail"][1], "b");
    }

    #[test]
    fn test_decode_envelope_rejects_bad_address() {
        let mut envelope = token();
        envelope.from = "nobody".to_string();
        let encoded = encode_envelope(&envelope).unwrap();

        assert!(matches!(
            decode_envelope(&encoded),
            Err(ProtocolError::Address(_))
        ));
    }

    #[test]
    fn test_decode_envelope_rejects_version() {
        let mut envelope = token();
        envelope.version = "UMF/2.0".to_string();
        let encoded = encode_envelope(&envelope).unwrap();

        assert!(matches!(
            decode_envelope(&encoded),
            Err(ProtocolError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_envelope(b"\xc1\xc1").is_err());
    }
}
