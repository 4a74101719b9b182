//! Live-client surface
//!
//! ```text
//! browser ──ws──▶ RelayServer ──accept──▶ LiveClient ──add──▶ SubscriberRegistry
//!    ▲                                        │
//!    └──────────── text frames ◀── outbound ──┘
//! ```
//!
//! Each connection gets a [`LiveClient`] registered with an all-channels
//! filter. Text frames from the browser are control messages; deliveries go
//! back as `{"collection", "document", "data"}` text frames.

pub mod client;
pub mod config;
pub mod listener;

pub use client::LiveClient;
pub use config::ServerConfig;
pub use listener::RelayServer;
