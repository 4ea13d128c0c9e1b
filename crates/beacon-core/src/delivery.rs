//! Envelope delivery to one instance.

use crate::presence::Keyspace;
use crate::store::{SharedStore, StoreError};
use async_trait::async_trait;
use beacon_protocol::{encode_envelope, Envelope, ProtocolError};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Delivery errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Nobody is listening on the target's inbox.
    #[error("No subscriber for instance: {0}")]
    NoSubscriber(String),

    /// The store rejected the publish.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The envelope could not be encoded.
    #[error(transparent)]
    Encoding(#[from] ProtocolError),
}

/// Shared delivery handle.
pub type SharedDelivery = Arc<dyn Delivery>;

/// Hands an envelope to one instance's transport endpoint.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Deliver `envelope` to `instance_id`.
    async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Delivers by publishing on the target's inbox channel.
pub struct StoreDelivery {
    store: SharedStore,
    keyspace: Keyspace,
}

impl StoreDelivery {
    /// Create a new store-backed delivery.
    #[must_use]
    pub fn new(store: SharedStore, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }
}

#[async_trait]
impl Delivery for StoreDelivery {
    async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<(), DeliveryError> {
        let payload = encode_envelope(envelope)?;
        let channel = self.keyspace.inbox_channel(instance_id);

        let receivers = self.store.publish(&channel, payload).await?;
        if receivers == 0 {
            return Err(DeliveryError::NoSubscriber(instance_id.to_string()));
        }

        trace!(
            instance = %instance_id,
            envelope = %envelope.id,
            receivers,
            "Delivered"
        );
        Ok(())
    }
}
