//! Subscriber capability and subscription filters

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DeliveryError;

use super::envelope::Envelope;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything that can receive fan-out deliveries.
///
/// `deliver` must not block: implementations hand the envelope off (to a
/// channel, a spawned write) and return. A returned error only affects this
/// subscriber.
pub trait Subscriber: Send + Sync {
    /// Stable identity used for set membership in the registry
    fn id(&self) -> SubscriberId;

    /// Whether this subscriber wants messages for `channel`
    fn is_interested_in(&self, channel: &str) -> bool;

    /// Hand an envelope to the subscriber
    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Which channels a subscriber wants
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionFilter {
    /// Every channel
    #[default]
    AllChannels,
    /// Only the listed channels
    SetOf(HashSet<String>),
}

impl SubscriptionFilter {
    /// Build a `SetOf` filter from channel names
    pub fn channels<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SubscriptionFilter::SetOf(names.into_iter().map(Into::into).collect())
    }

    /// Check whether `channel` passes the filter
    pub fn matches(&self, channel: &str) -> bool {
        match self {
            SubscriptionFilter::AllChannels => true,
            SubscriptionFilter::SetOf(names) => names.contains(channel),
        }
    }

    /// Add a single channel.
    ///
    /// An `AllChannels` filter narrows to just this channel.
    pub fn insert(&mut self, channel: impl Into<String>) {
        match self {
            SubscriptionFilter::AllChannels => {
                *self = SubscriptionFilter::SetOf(HashSet::from([channel.into()]));
            }
            SubscriptionFilter::SetOf(names) => {
                names.insert(channel.into());
            }
        }
    }

    /// Remove a single channel. No-op on `AllChannels`.
    pub fn remove(&mut self, channel: &str) {
        if let SubscriptionFilter::SetOf(names) = self {
            names.remove(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_channels_matches_everything() {
        let filter = SubscriptionFilter::default();
        assert!(filter.matches("orders"));
        assert!(filter.matches("anything.at.all"));
    }

    #[test]
    fn test_set_of_matches_members_only() {
        let filter = SubscriptionFilter::channels(["orders", "shipments"]);
        assert!(filter.matches("orders"));
        assert!(filter.matches("shipments"));
        assert!(!filter.matches("invoices"));
        // No prefix matching
        assert!(!filter.matches("orders.eu"));
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let filter = SubscriptionFilter::channels(Vec::<String>::new());
        assert!(!filter.matches("orders"));
    }

    #[test]
    fn test_insert_narrows_all_channels() {
        let mut filter = SubscriptionFilter::AllChannels;
        filter.insert("orders");
        assert_eq!(filter, SubscriptionFilter::channels(["orders"]));

        filter.insert("shipments");
        assert!(filter.matches("shipments"));
    }

    #[test]
    fn test_remove() {
        let mut filter = SubscriptionFilter::channels(["a", "b"]);
        filter.remove("a");
        assert!(!filter.matches("a"));
        assert!(filter.matches("b"));

        let mut all = SubscriptionFilter::AllChannels;
        all.remove("a");
        assert_eq!(all, SubscriptionFilter::AllChannels);
    }

    #[test]
    fn test_subscriber_ids_are_unique() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}
