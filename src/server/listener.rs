//! Live-client server listener
//!
//! Handles the TCP accept loop, upgrades each connection to WebSocket and
//! registers a [`LiveClient`] for it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::registry::{Subscriber, SubscriberRegistry};
use crate::server::client::LiveClient;
use crate::server::config::ServerConfig;

/// WebSocket endpoint for live clients
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SubscriberRegistry>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RelayServer {
    /// Create a server registering its clients into `registry`
    pub fn new(config: ServerConfig, registry: Arc<SubscriberRegistry>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get a reference to the subscriber registry
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails to bind.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        }
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Live-client server listening");

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let registry = Arc::clone(&self.registry);
        let buffer = self.config.client_buffer;
        let handshake_timeout = self.config.handshake_timeout;

        tokio::spawn(async move {
            let result = serve_client(
                session_id,
                socket,
                registry,
                buffer,
                handshake_timeout,
                permit,
            )
            .await;

            if let Err(e) = result {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }
}

/// Drive one client connection until either side closes it.
async fn serve_client(
    session_id: u64,
    socket: TcpStream,
    registry: Arc<SubscriberRegistry>,
    buffer: usize,
    handshake_timeout: Duration,
    _permit: Option<OwnedSemaphorePermit>,
) -> Result<()> {
    let handshake = tokio_tungstenite::accept_async(socket);
    let ws = match tokio::time::timeout(handshake_timeout, handshake).await {
        Ok(ws) => ws?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "WebSocket handshake timed out",
            )
            .into())
        }
    };
    let (mut sink, mut stream) = ws.split();

    let (client, mut outbound) = LiveClient::new(buffer);
    let client = Arc::new(client);
    let subscriber_id = client.id();
    registry.add(client.clone()).await;

    tracing::info!(
        session_id = session_id,
        subscriber = %subscriber_id,
        "Live client connected"
    );

    let result = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else { break Ok(()) };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break Err(e.into());
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = client.handle_control(&text) {
                        tracing::warn!(
                            subscriber = %subscriber_id,
                            error = %e,
                            "Ignoring malformed control message"
                        );
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // Pings are answered by tungstenite; binary frames carry nothing for us
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
            },
        }
    };

    registry.remove(subscriber_id).await;
    let _ = sink.close().await;

    tracing::info!(
        session_id = session_id,
        subscriber = %subscriber_id,
        "Live client disconnected"
    );

    result
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::registry::Envelope;

    async fn start(config: ServerConfig) -> (Arc<RelayServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new(
            config,
            Arc::new(SubscriberRegistry::new()),
        ));

        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        (server, addr)
    }

    async fn wait_for_clients(registry: &SubscriberRegistry, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.len().await != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_client_receives_deliveries() {
        let (server, addr) = start(ServerConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(server.registry(), 1).await;

        server
            .registry()
            .notify(&Envelope::new("orders", "42", json!({"x": 1})))
            .await;

        let message = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"collection": "orders", "document": "42", "data": {"x": 1}})
        );
    }

    #[tokio::test]
    async fn test_control_message_narrows_deliveries() {
        let (server, addr) = start(ServerConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(server.registry(), 1).await;

        ws.send(Message::Text(
            r#"{"subscribed_channels": ["shipments"]}"#.into(),
        ))
        .await
        .unwrap();

        // Wait until the filter is applied on the server side
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let report = server
                    .registry()
                    .notify(&Envelope::new("orders", "1", json!({})))
                    .await;
                if report.delivered == 0 {
                    break;
                }
                // Drain the frame that still got through
                ws.next().await.unwrap().unwrap();
            }
        })
        .await
        .unwrap();

        server
            .registry()
            .notify(&Envelope::new("shipments", "7", json!({"y": 2})))
            .await;

        let message = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(frame["collection"], "shipments");
        assert_eq!(frame["document"], "7");
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let (server, addr) = start(ServerConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(server.registry(), 1).await;

        ws.close(None).await.unwrap();
        wait_for_clients(server.registry(), 0).await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(ServerConfig::default().max_connections(1)).await;
        let (_first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(server.registry(), 1).await;

        assert!(connect_async(format!("ws://{}", addr)).await.is_err());
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_stalled_handshake_releases_slot() {
        let config = ServerConfig::default()
            .max_connections(1)
            .handshake_timeout(Duration::from_millis(100));
        let (server, addr) = start(config).await;

        // Opens TCP but never sends the upgrade request
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (_ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        wait_for_clients(server.registry(), 1).await;
    }
}
