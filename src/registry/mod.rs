//! Subscriber registry for channel fan-out
//!
//! The registry holds every party that wants broker messages: the persistence
//! sink and any number of live clients. Each envelope is offered to every
//! registered subscriber, and delivered to the ones whose filter accepts the
//! envelope's channel.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SubscriberRegistry>
//!                   ┌──────────────────────────────┐
//!                   │ subscribers: HashMap<Id,     │
//!                   │   Arc<dyn Subscriber>>       │
//!                   └──────────────┬───────────────┘
//!                                  │ notify(envelope)
//!         ┌────────────────────────┼────────────────────────┐
//!         │                        │                        │
//!         ▼                        ▼                        ▼
//!  [PersistenceSink]          [LiveClient]             [LiveClient]
//!  always interested          AllChannels              SetOf{"orders"}
//!  spawn(store.save())        tx.try_send() ──► WS     tx.try_send() ──► WS
//! ```
//!
//! `deliver` never awaits, so a slow subscriber cannot hold up the pass.

pub mod envelope;
pub mod store;
pub mod subscriber;

pub use envelope::Envelope;
pub use store::{NotifyReport, SubscriberRegistry};
pub use subscriber::{Subscriber, SubscriberId, SubscriptionFilter};
