//! Live client subscriber
//!
//! A `LiveClient` is the registry-facing half of a client connection.
//! Deliveries are encoded and queued on a bounded channel; the connection
//! task drains that channel onto the wire. The client starts out interested
//! in every channel until it sends a control message.

use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{ControlError, DeliveryError};
use crate::registry::{Envelope, Subscriber, SubscriberId, SubscriptionFilter};

/// Inbound control message
#[derive(Debug, Default, Deserialize)]
struct ControlMessage {
    #[serde(default)]
    subscribed_channels: Option<Vec<String>>,
}

/// A connected live client
pub struct LiveClient {
    id: SubscriberId,
    filter: RwLock<SubscriptionFilter>,
    outbound: mpsc::Sender<String>,
}

impl LiveClient {
    /// Create a client whose deliveries queue up to `buffer` messages.
    ///
    /// Returns the client and the receiving end of its outbound queue.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let client = Self {
            id: SubscriberId::next(),
            filter: RwLock::new(SubscriptionFilter::AllChannels),
            outbound,
        };
        (client, rx)
    }

    /// Current filter
    pub fn filter(&self) -> SubscriptionFilter {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the filter wholesale
    pub fn set_filter(&self, filter: SubscriptionFilter) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Add one channel to the filter
    pub fn subscribe(&self, channel: impl Into<String>) {
        self.filter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel);
    }

    /// Remove one channel from the filter
    pub fn unsubscribe(&self, channel: &str) {
        self.filter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
    }

    /// Apply a control message received from the client.
    ///
    /// `{"subscribed_channels": [..]}` replaces the filter with exactly those
    /// channels. A missing, null or empty list leaves the filter as it is.
    pub fn handle_control(&self, text: &str) -> Result<(), ControlError> {
        let message: ControlMessage = serde_json::from_str(text).map_err(ControlError)?;

        match message.subscribed_channels {
            Some(channels) if !channels.is_empty() => {
                tracing::debug!(
                    subscriber = %self.id,
                    channels = ?channels,
                    "Subscriptions updated"
                );
                self.set_filter(SubscriptionFilter::channels(channels));
            }
            _ => {
                tracing::trace!(subscriber = %self.id, "Control message without channels ignored");
            }
        }

        Ok(())
    }
}

impl Subscriber for LiveClient {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn is_interested_in(&self, channel: &str) -> bool {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(channel)
    }

    fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let frame = envelope
            .to_client_json()
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn test_new_client_wants_everything() {
        let (client, _rx) = LiveClient::new(4);
        assert_eq!(client.filter(), SubscriptionFilter::AllChannels);
        assert!(client.is_interested_in("orders"));
    }

    #[test]
    fn test_control_replaces_filter() {
        let (client, _rx) = LiveClient::new(4);

        client
            .handle_control(r#"{"subscribed_channels": ["a", "b"]}"#)
            .unwrap();
        assert_eq!(client.filter(), SubscriptionFilter::channels(["a", "b"]));

        // A second update replaces, it does not merge
        client
            .handle_control(r#"{"subscribed_channels": ["c"]}"#)
            .unwrap();
        assert_eq!(client.filter(), SubscriptionFilter::channels(["c"]));
        assert!(!client.is_interested_in("a"));
    }

    #[test]
    fn test_control_without_channels_is_ignored() {
        let (client, _rx) = LiveClient::new(4);
        client.set_filter(SubscriptionFilter::channels(["keep"]));

        client.handle_control(r#"{}"#).unwrap();
        client
            .handle_control(r#"{"subscribed_channels": null}"#)
            .unwrap();
        client
            .handle_control(r#"{"subscribed_channels": [], "other": 1}"#)
            .unwrap();

        assert_eq!(client.filter(), SubscriptionFilter::channels(["keep"]));
    }

    #[test]
    fn test_malformed_control_rejected() {
        let (client, _rx) = LiveClient::new(4);

        assert!(client.handle_control("not json").is_err());
        assert!(client
            .handle_control(r#"{"subscribed_channels": "orders"}"#)
            .is_err());
        assert_eq!(client.filter(), SubscriptionFilter::AllChannels);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let (client, _rx) = LiveClient::new(4);

        client.subscribe("orders");
        assert!(client.is_interested_in("orders"));
        assert!(!client.is_interested_in("shipments"));

        client.subscribe("shipments");
        client.unsubscribe("orders");
        assert_eq!(client.filter(), SubscriptionFilter::channels(["shipments"]));
    }

    #[tokio::test]
    async fn test_deliver_writes_client_frame() {
        let (client, mut rx) = LiveClient::new(4);

        client
            .deliver(&Envelope::new("orders", "42", json!({"x": 1})))
            .unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"collection": "orders", "document": "42", "data": {"x": 1}})
        );
    }

    #[test]
    fn test_deliver_full_buffer_is_backpressure() {
        let (client, _rx) = LiveClient::new(1);
        let envelope = Envelope::new("orders", "1", json!({}));

        client.deliver(&envelope).unwrap();
        assert_eq!(client.deliver(&envelope), Err(DeliveryError::Backpressure));
    }

    #[test]
    fn test_deliver_after_disconnect_is_closed() {
        let (client, rx) = LiveClient::new(4);
        drop(rx);

        let result = client.deliver(&Envelope::new("orders", "1", json!({})));
        assert_eq!(result, Err(DeliveryError::Closed));
    }
}
