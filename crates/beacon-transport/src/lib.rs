//! # beacon-transport
//!
//! Client side of the Beacon store protocol.
//!
//! [`RemoteStore`] connects to a `beacon-store` server over WebSocket and
//! implements [`beacon_core::PresenceStore`], so sessions in different
//! processes share presence and inboxes through one server.
//!
//! ```rust,ignore
//! use beacon_transport::{RemoteStore, RemoteStoreConfig};
//!
//! let store = RemoteStore::connect(RemoteStoreConfig::new("ws://127.0.0.1:7400/ws")).await?;
//! let session = Session::new(config, Arc::new(store))?;
//! ```

pub mod error;
pub mod websocket;

pub use error::TransportError;
pub use websocket::{RemoteStore, RemoteStoreConfig};
