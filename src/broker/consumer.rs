//! Consumer loop
//!
//! Takes deliveries off a bound channel and turns each one into a fan-out:
//! decode the body, resolve the routing key, notify the registry. A message
//! that fails decoding or resolution is dropped whole; nothing downstream
//! sees it. Consumption runs in no-ack mode, so a dropped message is gone.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::error::{BrokerError, DecodeError, Error};
use crate::registry::{Envelope, NotifyReport, SubscriberRegistry};
use crate::routing::ChannelKeyResolver;
use crate::stats::RelayStats;

use super::{BrokerChannel, RawDelivery};

/// Why a consume session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeEnd {
    /// Stop was requested
    Stopped,
    /// The channel stopped yielding deliveries
    Failed(BrokerError),
}

/// Per-message processing for a consume session
pub struct ConsumerLoop {
    resolver: ChannelKeyResolver,
    registry: Arc<SubscriberRegistry>,
    stats: Arc<RelayStats>,
}

impl ConsumerLoop {
    /// Create a consumer loop dispatching into `registry`
    pub fn new(
        resolver: ChannelKeyResolver,
        registry: Arc<SubscriberRegistry>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            resolver,
            registry,
            stats,
        }
    }

    /// Get the stats handle
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Consume until the channel fails or `stop` flips to `true`.
    ///
    /// The caller has already declared the topology and issued the consume.
    pub async fn run<C: BrokerChannel>(
        &self,
        channel: &mut C,
        stop: &mut watch::Receiver<bool>,
    ) -> ConsumeEnd {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop_requested(stop) => return ConsumeEnd::Stopped,
                delivery = channel.next_delivery() => delivery,
            };

            match delivery {
                Ok(delivery) => {
                    // Already logged and counted; a dropped message does not end the session
                    if let Err(e) = self.process(delivery).await {
                        tracing::trace!(error = %e, "Delivery dropped, consuming next");
                    }
                }
                Err(e) => return ConsumeEnd::Failed(e),
            }
        }
    }

    /// Process a single delivery.
    pub async fn process(&self, delivery: RawDelivery) -> Result<NotifyReport, Error> {
        self.stats.record_received();

        let payload: Value = match serde_json::from_slice(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_decode_failure();
                tracing::error!(
                    delivery_tag = delivery.delivery_tag,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Dropping message with undecodable body"
                );
                return Err(DecodeError(e).into());
            }
        };

        tracing::debug!(
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
            "Received message"
        );

        let key = match self.resolver.resolve(&delivery.routing_key) {
            Ok(key) => key,
            Err(e) => {
                self.stats.record_invalid_key();
                tracing::error!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Dropping message with invalid channel key"
                );
                return Err(e.into());
            }
        };

        let envelope = Envelope::from_key(key, payload);
        let report = self.registry.notify(&envelope).await;
        self.stats.record_dispatch(&report);

        tracing::debug!(
            channel = %envelope.channel,
            entity = %envelope.entity_id,
            delivered = report.delivered,
            failed = report.failed,
            "Message dispatched"
        );

        Ok(report)
    }
}

/// Resolves once `stop` reads `true`; never resolves if the sender is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        let requested = *stop.borrow_and_update();
        if requested {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
