//! Persistence sink
//!
//! The sink is a subscriber interested in every channel. Each delivery spawns
//! a write to a [`DocumentStore`] and returns at once, so persistence never
//! holds up fan-out to live clients. A failed write is logged, not retried.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{DeliveryError, StoreError};
use crate::registry::{Envelope, Subscriber, SubscriberId};

pub use memory::MemoryStore;

/// Field holding the entity id in a stored document
pub const ID_FIELD: &str = "_id";

/// Backend that stores payloads by channel and entity id
///
/// The sink hands over the decoded payload untouched; how it is laid out as
/// a stored document is up to the store.
pub trait DocumentStore: Send + Sync + 'static {
    /// Persist `payload` under `channel` with the given entity id
    fn save(
        &self,
        channel: &str,
        entity_id: &str,
        payload: Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Build the stored form of a payload: a copy with `_id` set to the entity id.
///
/// Non-object payloads are wrapped as `{"_id": .., "value": ..}`.
pub fn to_document(entity_id: &str, payload: &Value) -> Value {
    let mut document = match payload {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut fields = Map::new();
            fields.insert("value".to_string(), other.clone());
            fields
        }
    };
    document.insert(ID_FIELD.to_string(), Value::String(entity_id.to_string()));
    Value::Object(document)
}

/// Subscriber that writes every envelope to a store
pub struct PersistenceSink<S: DocumentStore> {
    id: SubscriberId,
    store: Arc<S>,
}

impl<S: DocumentStore> PersistenceSink<S> {
    /// Create a sink writing to `store`
    pub fn new(store: Arc<S>) -> Self {
        Self {
            id: SubscriberId::next(),
            store,
        }
    }

    /// Get the underlying store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: DocumentStore> Subscriber for PersistenceSink<S> {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn is_interested_in(&self, _channel: &str) -> bool {
        true
    }

    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let store = Arc::clone(&self.store);
        let channel = envelope.channel.clone();
        let entity_id = envelope.entity_id.clone();
        let payload = envelope.payload.clone();

        tokio::spawn(async move {
            match store.save(&channel, &entity_id, payload).await {
                Ok(()) => {
                    tracing::info!(channel = %channel, entity = %entity_id, "Document saved");
                }
                Err(e) => {
                    tracing::error!(
                        channel = %channel,
                        entity = %entity_id,
                        error = %e,
                        "Failed to save document"
                    );
                }
            }
        });

        Ok(())
    }
}
