//! Broker connection, topology and consumption
//!
//! The relay talks to the broker through three small traits so the connection
//! state machine can run against RabbitMQ (`amqp` feature) or the in-process
//! [`MemoryBroker`].
//!
//! ```text
//!  ConnectionSupervisor
//!     │ connect()                        ┌── Disconnected ◄─────────┐
//!     ▼                                  │       │ connect          │ unexpected close
//!  BrokerConnection ── open_channel() ─► │   Connecting             │ (sleep, retry)
//!     │                                  │       │ accepted         │
//!     ▼                                  │     Open ────────────────┘
//!  BrokerChannel                         │       │ stop()
//!     │ declare exchange ─► queue ─► bind│    Closing
//!     │ consume (no-ack)                 │       │
//!     ▼                                  └─►  Stopped
//!  ConsumerLoop ─► resolve ─► SubscriberRegistry::notify
//! ```

use std::future::Future;

use bytes::Bytes;

use crate::error::BrokerError;

pub mod config;
pub mod consumer;
pub mod memory;
pub mod supervisor;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use config::{BrokerConfig, ExchangeKind, ExchangeSpec, QueueMode, QueueSpec, Topology};
pub use consumer::{ConsumeEnd, ConsumerLoop};
pub use memory::{BrokerOp, MemoryBroker};
pub use supervisor::{
    ChannelState, ConnectionSupervisor, SupervisorHandle, SupervisorState, SupervisorStatus,
};
pub use topology::BoundTopology;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;

/// A message as taken off the broker, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    /// Broker-assigned delivery tag
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key set by the publisher
    pub routing_key: String,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// Raw body
    pub body: Bytes,
}

/// Options for starting a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Tag identifying the consumer on its channel
    pub consumer_tag: String,
    /// Deliveries count as acknowledged once sent
    pub no_ack: bool,
}

/// Opens connections to the broker
pub trait BrokerConnector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a new connection
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, BrokerError>> + Send;
}

/// An open broker connection
pub trait BrokerConnection: Send + 'static {
    type Channel: BrokerChannel;

    /// Open a channel on this connection
    fn open_channel(&mut self) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// Close the connection
    fn close(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// A channel on an open connection
///
/// Each call completes only once the broker has answered it.
pub trait BrokerChannel: Send + 'static {
    /// Declare an exchange
    fn declare_exchange(
        &mut self,
        spec: &ExchangeSpec,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Declare a queue, returning its name (generated when `spec.name` is empty)
    fn declare_queue(
        &mut self,
        spec: &QueueSpec,
    ) -> impl Future<Output = Result<String, BrokerError>> + Send;

    /// Bind a queue to an exchange
    fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Start consuming from a queue, returning the consumer tag
    fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> impl Future<Output = Result<String, BrokerError>> + Send;

    /// Wait for the next delivery.
    ///
    /// An error means consumption on this channel is over: the channel or the
    /// connection closed, or the broker cancelled the consumer.
    fn next_delivery(&mut self) -> impl Future<Output = Result<RawDelivery, BrokerError>> + Send;

    /// Cancel a consumer
    fn cancel(&mut self, consumer_tag: &str)
        -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Close the channel
    fn close(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
