//! RabbitMQ relay
//!
//! Run with: cargo run --example amqp_relay --features amqp -- [BROKER_HOST] [BIND_ADDR] [--per-instance]
//!
//! Examples:
//!   cargo run --example amqp_relay --features amqp                          # localhost broker, 0.0.0.0:8888
//!   cargo run --example amqp_relay --features amqp -- rabbit.local          # remote broker
//!   cargo run --example amqp_relay --features amqp -- localhost 127.0.0.1:9000
//!   cargo run --example amqp_relay --features amqp -- localhost --per-instance
//!
//! With `--per-instance` each running relay gets its own queue and sees every
//! message. Without it, relays share the `text` queue and split the traffic.
//!
//! Publish a test message:
//!   rabbitmqadmin publish exchange=test-exchange routing_key=orders.42 payload='{"total": 10}'

use std::net::SocketAddr;
use std::sync::Arc;

use amqp_relay::broker::{AmqpConnector, BrokerConfig, ConnectionSupervisor, QueueMode};
use amqp_relay::registry::SubscriberRegistry;
use amqp_relay::routing::ChannelKeyResolver;
use amqp_relay::server::{RelayServer, ServerConfig};
use amqp_relay::sink::{MemoryStore, PersistenceSink};

fn print_usage() {
    eprintln!("Usage: amqp_relay [BROKER_HOST] [BIND_ADDR] [--per-instance]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BROKER_HOST     RabbitMQ host (default: localhost)");
    eprintln!("  BIND_ADDR       Live-client address (default: 0.0.0.0:8888)");
    eprintln!("  --per-instance  Consume from a private queue instead of the shared one");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let per_instance = args.iter().any(|a| a == "--per-instance");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    let mut broker_config = match positional.first() {
        Some(host) => BrokerConfig::with_host(host.as_str()),
        None => BrokerConfig::default(),
    };
    if per_instance {
        broker_config = broker_config.queue_mode(QueueMode::PerInstance);
    }

    let bind_addr: SocketAddr = match positional.get(1) {
        Some(addr) => match addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: invalid bind address '{}': {}", addr, e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => ServerConfig::default().bind_addr,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("amqp_relay=debug".parse()?)
                .add_directive("lapin=warn".parse()?),
        )
        .init();

    let registry = Arc::new(SubscriberRegistry::new());
    let store = Arc::new(MemoryStore::new());
    registry
        .add(Arc::new(PersistenceSink::new(Arc::clone(&store))))
        .await;

    println!("Consuming from amqp://{}:{}", broker_config.host, broker_config.port);
    println!("Live clients: ws://{}", bind_addr);

    let supervisor = ConnectionSupervisor::new(
        AmqpConnector::new(&broker_config),
        broker_config,
        ChannelKeyResolver::default(),
        Arc::clone(&registry),
    );
    let stats = Arc::clone(supervisor.stats());
    let (handle, task) = supervisor.spawn();

    let server = RelayServer::new(ServerConfig::with_addr(bind_addr), registry);

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

    handle.stop();
    task.await?;

    println!("{:#?}", stats.snapshot());
    Ok(())
}
