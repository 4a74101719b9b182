//! # amqp-relay
//!
//! Consumes JSON messages from an AMQP fan-out exchange and relays each one
//! to a set of subscribers: a persistence sink that stores every message,
//! and live clients that receive only the channels they asked for.
//!
//! ```text
//!  broker ──▶ ConnectionSupervisor ──▶ ConsumerLoop ──▶ ChannelKeyResolver
//!   (exchange ─ queue ─ binding)          │ decode          │ "orders.42"
//!                                         ▼                 ▼
//!                                   SubscriberRegistry ◀── Envelope
//!                                    │             │
//!                                    ▼             ▼
//!                             PersistenceSink   LiveClient ──▶ WebSocket
//! ```
//!
//! The supervisor owns the broker lifecycle: it connects, re-declares the
//! topology on every (re)connect, consumes in no-ack mode and reconnects
//! after a fixed delay when the connection or channel goes away. Messages
//! are delivered at most once.
//!
//! Two broker backends are provided: [`broker::MemoryBroker`], an in-process
//! broker used by tests and the `memory_relay` demo, and
//! `broker::AmqpConnector` for RabbitMQ behind the `amqp` feature.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use amqp_relay::broker::{BrokerConfig, ConnectionSupervisor, MemoryBroker};
//! use amqp_relay::registry::SubscriberRegistry;
//! use amqp_relay::routing::ChannelKeyResolver;
//! use amqp_relay::sink::{MemoryStore, PersistenceSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = MemoryBroker::new();
//!     let registry = Arc::new(SubscriberRegistry::new());
//!     let store = Arc::new(MemoryStore::new());
//!     registry.add(Arc::new(PersistenceSink::new(store))).await;
//!
//!     let supervisor = ConnectionSupervisor::new(
//!         broker.connector(),
//!         BrokerConfig::default(),
//!         ChannelKeyResolver::default(),
//!         registry,
//!     );
//!     let (handle, task) = supervisor.spawn();
//!
//!     broker.publish("test-exchange", "orders.42", r#"{"total": 10}"#);
//!
//!     handle.stop();
//!     task.await.unwrap();
//! }
//! ```

pub mod broker;
pub mod error;
pub mod registry;
pub mod routing;
pub mod server;
pub mod sink;
pub mod stats;

pub use broker::{BrokerConfig, ConnectionSupervisor, SupervisorHandle};
pub use error::{Error, Result};
pub use registry::{Envelope, Subscriber, SubscriberRegistry, SubscriptionFilter};
pub use routing::{ChannelKey, ChannelKeyResolver};
pub use server::{LiveClient, RelayServer, ServerConfig};
pub use sink::{DocumentStore, MemoryStore, PersistenceSink};
pub use stats::{RelayStats, StatsSnapshot};
