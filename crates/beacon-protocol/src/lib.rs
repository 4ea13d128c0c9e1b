//! # beacon-protocol
//!
//! Message format and wire protocol definitions for Beacon.
//!
//! This crate defines everything that crosses a process boundary:
//!
//! - **Address** - `[<instance>@]<service>:/<path>` routing grammar
//! - **Envelope** - the universal message unit passed between peers
//! - **Frame** - requests, replies and pushes of the store wire protocol
//! - **Codec** - MessagePack encoding for frames and envelopes
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Address, Body, Envelope};
//!
//! let to = Address::service("hot-potato", "/");
//! let from = Address::instance("a1", "hot-potato", "/");
//! let envelope = Envelope::new(&to, &from, "hotpotato", Body::new());
//!
//! let encoded = codec::encode_envelope(&envelope).unwrap();
//! let decoded = codec::decode_envelope(&encoded).unwrap();
//! assert_eq!(decoded.id, envelope.id);
//! ```

pub mod address;
pub mod codec;
pub mod envelope;
pub mod frames;

pub use address::{Address, AddressError};
pub use codec::{decode, decode_envelope, encode, encode_envelope, ProtocolError};
pub use envelope::{Body, Envelope, EnvelopeId, UMF_VERSION};
pub use frames::{Frame, FrameType};
