//! # beacon-core
//!
//! Presence, peer routing and the session state machine for Beacon.
//!
//! This crate provides the building blocks:
//!
//! - **Store** - The shared key/value + pub/sub collaborator, and an in-memory implementation
//! - **Registry** - Registration and heartbeat of one instance
//! - **Presence** - Listing the live instances of a service
//! - **Router** - Direct, peer-excluding and broadcast envelope delivery
//! - **Session** - The token hand-off state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│  Delivery   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │────▶│    Store    │◀────│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod delivery;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use config::{RetryConfig, SessionConfig};
pub use delivery::{Delivery, DeliveryError, SharedDelivery, StoreDelivery};
pub use memory::MemoryStore;
pub use presence::{InstanceAddress, Keyspace, PresenceDirectory, ServiceInstance};
pub use registry::{RegistryClient, RegistryError, RetryPolicy};
pub use router::{select_peer, select_peer_skipping, BroadcastReport, Router, RouterError};
pub use session::{Session, SessionError, SessionHandle, SessionOutcome, SessionState};
pub use store::{PresenceStore, SharedStore, StoreError, Subscription};
