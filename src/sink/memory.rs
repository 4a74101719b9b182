//! In-process document store

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::error::StoreError;

use super::{to_document, DocumentStore};

#[derive(Default)]
struct Collection {
    documents: HashMap<String, Value>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Document store kept in memory, one collection per channel
///
/// Payloads are stored in document form (see [`to_document`]). Inserting an
/// entity id that already exists in a collection is rejected. With a cap set, each collection keeps at most that many documents and
/// evicts the oldest first.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    cap: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store capping every collection at `cap` documents
    pub fn capped(cap: usize) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            cap: Some(cap.max(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Collection>> {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `payload` as a document keyed by `entity_id`, rejecting duplicate ids
    pub fn insert(&self, channel: &str, entity_id: &str, payload: &Value) -> Result<(), StoreError> {
        let mut collections = self.lock();
        let collection = collections.entry(channel.to_string()).or_default();

        if collection.documents.contains_key(entity_id) {
            return Err(StoreError::Rejected(format!(
                "duplicate id '{}' in '{}'",
                entity_id, channel
            )));
        }

        if let Some(cap) = self.cap {
            while collection.order.len() >= cap {
                match collection.order.pop_front() {
                    Some(oldest) => {
                        collection.documents.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        collection
            .documents
            .insert(entity_id.to_string(), to_document(entity_id, payload));
        collection.order.push_back(entity_id.to_string());
        Ok(())
    }

    /// Fetch a stored document
    pub fn get(&self, channel: &str, entity_id: &str) -> Option<Value> {
        self.lock()
            .get(channel)
            .and_then(|c| c.documents.get(entity_id))
            .cloned()
    }

    /// Names of collections holding at least one document, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, c)| !c.documents.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of documents in a collection
    pub fn len(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }

    /// Whether a collection is empty
    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }
}

impl DocumentStore for MemoryStore {
    async fn save(&self, channel: &str, entity_id: &str, payload: Value) -> Result<(), StoreError> {
        self.insert(channel, entity_id, &payload)
    }
}
