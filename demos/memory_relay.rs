//! In-process relay demo
//!
//! Run with: cargo run --example memory_relay [BIND_ADDR]
//!
//! Starts the relay against an in-process broker, publishes a sample order
//! or shipment every second and serves live clients over WebSocket.
//!
//! Connect with any WebSocket client, e.g. websocat:
//!   websocat ws://127.0.0.1:8888
//!
//! and narrow the feed by sending:
//!   {"subscribed_channels": ["shipments"]}
//!
//! Ctrl+C stops the relay and prints what the store holds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amqp_relay::broker::{BrokerConfig, ConnectionSupervisor, MemoryBroker, SupervisorState};
use amqp_relay::registry::SubscriberRegistry;
use amqp_relay::routing::ChannelKeyResolver;
use amqp_relay::server::{RelayServer, ServerConfig};
use amqp_relay::sink::{MemoryStore, PersistenceSink};

fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    const DEFAULT_PORT: u16 = 8888;

    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let bind_addr = match args.get(1) {
        Some(addr) => parse_bind_addr(addr)?,
        None => ServerConfig::default().bind_addr,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("amqp_relay=debug".parse()?)
                .add_directive("memory_relay=debug".parse()?),
        )
        .init();

    let broker = MemoryBroker::new();
    let registry = Arc::new(SubscriberRegistry::new());
    let store = Arc::new(MemoryStore::capped(1000));
    registry
        .add(Arc::new(PersistenceSink::new(Arc::clone(&store))))
        .await;

    let config = BrokerConfig::default().reconnect_delay(Duration::from_secs(1));
    let exchange = config.topology.exchange.name.clone();

    let supervisor = ConnectionSupervisor::new(
        broker.connector(),
        config,
        ChannelKeyResolver::default(),
        Arc::clone(&registry),
    );
    let stats = Arc::clone(supervisor.stats());
    let (handle, task) = supervisor.spawn();

    handle
        .wait_for(|status| status.state == SupervisorState::Open && status.consuming)
        .await;

    // Publish sample traffic
    let publisher = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            for n in 0u64.. {
                ticker.tick().await;
                let (channel, body) = if n % 2 == 0 {
                    ("orders", format!(r#"{{"total": {}}}"#, n * 10))
                } else {
                    ("shipments", format!(r#"{{"carrier": "post", "parcel": {}}}"#, n))
                };
                broker.publish(&exchange, &format!("{}.{}", channel, n), body);
            }
        })
    };

    let server = RelayServer::new(ServerConfig::with_addr(bind_addr), registry);
    println!("Live clients: ws://{}", bind_addr);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    publisher.abort();
    handle.stop();
    task.await?;

    let snapshot = stats.snapshot();
    println!(
        "Received {} messages, dispatched {}, dropped {}",
        snapshot.messages_received,
        snapshot.envelopes_dispatched,
        snapshot.dropped()
    );
    for collection in store.collections() {
        println!("  {}: {} documents", collection, store.len(&collection));
    }

    Ok(())
}
