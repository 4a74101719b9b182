//! Topology declaration
//!
//! Runs on every freshly opened channel: exchange, then queue, then binding.
//! Each step waits for the broker's answer before the next is issued, and the
//! parameters are identical every time so redeclaring after a reconnect is
//! accepted by the broker.

use crate::error::BrokerError;

use super::config::Topology;
use super::BrokerChannel;

/// Result of a successful declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTopology {
    /// Exchange the queue is bound to
    pub exchange: String,
    /// Name of the bound queue (broker-generated for per-instance queues)
    pub queue: String,
}

impl Topology {
    /// Declare exchange, queue and binding on `channel`.
    ///
    /// Any failure is a channel-level failure; the caller escalates it.
    pub async fn declare<C: BrokerChannel>(
        &self,
        channel: &mut C,
    ) -> Result<BoundTopology, BrokerError> {
        tracing::info!(
            exchange = %self.exchange.name,
            kind = self.exchange.kind.as_str(),
            "Declaring exchange"
        );
        channel.declare_exchange(&self.exchange).await?;
        tracing::debug!(exchange = %self.exchange.name, "Exchange declared");

        tracing::info!(queue = %self.queue.name, "Declaring queue");
        let queue = channel.declare_queue(&self.queue).await?;
        tracing::debug!(queue = %queue, "Queue declared");

        tracing::info!(exchange = %self.exchange.name, queue = %queue, "Binding queue");
        channel
            .bind_queue(&queue, &self.exchange.name, &self.binding_key)
            .await?;
        tracing::info!(exchange = %self.exchange.name, queue = %queue, "Queue bound");

        Ok(BoundTopology {
            exchange: self.exchange.name.clone(),
            queue,
        })
    }
}
