//! Subscriber registry implementation
//!
//! Holds the current subscriber set and fans envelopes out to it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::envelope::Envelope;
use super::subscriber::{Subscriber, SubscriberId};

/// Outcome of a single fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Subscribers in the snapshot
    pub considered: usize,
    /// Subscribers that accepted the envelope
    pub delivered: usize,
    /// Subscribers whose delivery failed
    pub failed: usize,
}

/// Registry of subscribers keyed by id
///
/// Mutations take the write lock briefly; `notify` copies the current set
/// under the read lock and delivers outside it, so registrations that race a
/// fan-out pass neither join nor leave that pass.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber. Adding an already registered id is a no-op.
    pub async fn add(&self, subscriber: Arc<dyn Subscriber>) {
        let id = subscriber.id();
        let mut subscribers = self.subscribers.write().await;

        if subscribers.contains_key(&id) {
            tracing::trace!(subscriber = %id, "Subscriber already registered");
            return;
        }

        subscribers.insert(id, subscriber);
        tracing::info!(
            subscriber = %id,
            subscribers = subscribers.len(),
            "Subscriber added"
        );
    }

    /// Deregister a subscriber. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;

        if subscribers.remove(&id).is_some() {
            tracing::info!(
                subscriber = %id,
                subscribers = subscribers.len(),
                "Subscriber removed"
            );
        }
    }

    /// Check whether a subscriber is registered
    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    /// Number of registered subscribers
    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Deliver an envelope to every interested subscriber.
    ///
    /// A failing subscriber is logged and skipped; it never stops delivery to
    /// the rest of the snapshot.
    pub async fn notify(&self, envelope: &Envelope) -> NotifyReport {
        let snapshot: Vec<Arc<dyn Subscriber>> =
            self.subscribers.read().await.values().cloned().collect();

        let mut report = NotifyReport {
            considered: snapshot.len(),
            ..NotifyReport::default()
        };

        for subscriber in snapshot {
            if !subscriber.is_interested_in(&envelope.channel) {
                continue;
            }

            match subscriber.deliver(envelope) {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::trace!(
                        subscriber = %subscriber.id(),
                        channel = %envelope.channel,
                        entity = %envelope.entity_id,
                        "Notified subscriber"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscriber = %subscriber.id(),
                        channel = %envelope.channel,
                        error = %e,
                        "Delivery to subscriber failed"
                    );
                }
            }
        }

        report
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
