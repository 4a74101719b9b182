//! Connection supervisor
//!
//! Owns the broker connection lifecycle. Each session walks the same steps:
//!
//! ```text
//! Disconnected ─► Connecting ─► Open ─► channel Opening ─► channel Open
//!      ▲                                                        │
//!      │                        declare exchange, queue, binding│
//!      │                                 consume (no-ack)       │
//!      │                                                        ▼
//!      └──── sleep(reconnect_delay) ◄──── unexpected close ◄── consuming
//!
//!                     stop() ─► Closing ─► Stopped (terminal)
//! ```
//!
//! A channel-level failure (protocol violation, failed declaration, consumer
//! cancelled by the broker) always tears the whole connection down and goes
//! through the reconnect path. Once `stop()` has been called no further
//! connect is attempted, whatever close events arrive afterwards.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::BrokerError;
use crate::registry::SubscriberRegistry;
use crate::routing::ChannelKeyResolver;
use crate::stats::RelayStats;

use super::config::BrokerConfig;
use super::consumer::{stop_requested, ConsumeEnd, ConsumerLoop};
use super::{BrokerChannel, BrokerConnection, BrokerConnector, ConsumeOptions};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No connection; a connect may be pending
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connection established
    Open,
    /// Orderly shutdown in progress
    Closing,
    /// Shut down; terminal
    Stopped,
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel
    Closed,
    /// Channel open requested
    Opening,
    /// Channel usable for declarations and consumption
    Open,
}

/// Observable supervisor status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Connection state
    pub state: SupervisorState,
    /// Channel state
    pub channel: ChannelState,
    /// Whether deliveries are being consumed
    pub consuming: bool,
    /// Number of consume sessions started so far
    pub sessions: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Disconnected,
            channel: ChannelState::Closed,
            consuming: false,
            sessions: 0,
        }
    }
}

/// How a session ended
enum SessionEnd {
    Stopped,
    Failed(BrokerError),
}

struct Shared {
    stop: watch::Sender<bool>,
    status: watch::Sender<SupervisorStatus>,
}

/// Handle for stopping and observing a supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    /// Request shutdown. Idempotent; later close events never reconnect.
    pub fn stop(&self) {
        self.shared.stop.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                tracing::info!("Stopping");
                *stopping = true;
                true
            }
        });
    }

    /// Whether stop has been requested
    pub fn is_stopping(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Current status
    pub fn status(&self) -> SupervisorStatus {
        *self.shared.status.borrow()
    }

    /// Current connection state
    pub fn state(&self) -> SupervisorState {
        self.status().state
    }

    /// Wait until the status satisfies `predicate`, returning that status
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SupervisorStatus) -> bool,
    ) -> SupervisorStatus {
        let mut rx = self.shared.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if predicate(&status) {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Drives connect, topology, consume and reconnect for one broker
pub struct ConnectionSupervisor<C: BrokerConnector> {
    connector: C,
    config: BrokerConfig,
    consumer: ConsumerLoop,
    shared: Arc<Shared>,
}

impl<C: BrokerConnector> ConnectionSupervisor<C> {
    /// Create a supervisor dispatching into `registry`.
    pub fn new(
        connector: C,
        config: BrokerConfig,
        resolver: ChannelKeyResolver,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self::with_stats(
            connector,
            config,
            resolver,
            registry,
            Arc::new(RelayStats::new()),
        )
    }

    /// Create a supervisor recording into existing stats
    pub fn with_stats(
        connector: C,
        config: BrokerConfig,
        resolver: ChannelKeyResolver,
        registry: Arc<SubscriberRegistry>,
        stats: Arc<RelayStats>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let (status, _) = watch::channel(SupervisorStatus::default());

        Self {
            connector,
            config,
            consumer: ConsumerLoop::new(resolver, registry, stats),
            shared: Arc::new(Shared { stop, status }),
        }
    }

    /// Handle for stopping and observing this supervisor
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Relay statistics
    pub fn stats(&self) -> &Arc<RelayStats> {
        self.consumer.stats()
    }

    /// Spawn [`run`](Self::run) on the tokio runtime
    pub fn spawn(self) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Connect and consume until stopped, reconnecting after failures.
    pub async fn run(self) {
        let mut stop = self.shared.stop.subscribe();
        let mut session: u64 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            session += 1;
            match self.run_session(session, &mut stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Failed(e) => {
                    self.set_status(|s| {
                        s.state = SupervisorState::Disconnected;
                        s.channel = ChannelState::Closed;
                        s.consuming = false;
                    });

                    if *stop.borrow() {
                        break;
                    }

                    self.stats().record_reconnect_scheduled();
                    tracing::warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Connection closed, reopening"
                    );

                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop) => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        self.set_status(|s| {
            s.state = SupervisorState::Stopped;
            s.channel = ChannelState::Closed;
            s.consuming = false;
        });
        tracing::info!("Stopped");
    }

    async fn run_session(&self, session: u64, stop: &mut watch::Receiver<bool>) -> SessionEnd {
        self.set_status(|s| s.state = SupervisorState::Connecting);
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.virtual_host,
            "Connecting"
        );

        let connected = tokio::select! {
            biased;
            _ = stop_requested(stop) => return SessionEnd::Stopped,
            connected = self.connector.connect() => connected,
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(e) => return SessionEnd::Failed(e),
        };

        self.stats().record_connection_opened();
        self.set_status(|s| {
            s.state = SupervisorState::Open;
            s.channel = ChannelState::Opening;
        });
        tracing::info!("Connection opened");

        let opened = tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                self.close_connection(&mut connection).await;
                return SessionEnd::Stopped;
            }
            opened = connection.open_channel() => opened,
        };
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => return self.escalate(&mut connection, e).await,
        };

        self.set_status(|s| s.channel = ChannelState::Open);
        tracing::info!("Channel opened");

        let declared = tokio::select! {
            biased;
            _ = stop_requested(stop) => {
                self.close_channel(&mut channel).await;
                self.close_connection(&mut connection).await;
                return SessionEnd::Stopped;
            }
            declared = self.config.topology.declare(&mut channel) => declared,
        };
        let bound = match declared {
            Ok(bound) => bound,
            Err(e) => return self.escalate(&mut connection, e).await,
        };

        let options = ConsumeOptions {
            consumer_tag: format!("{}-{}", self.config.consumer_tag, session),
            no_ack: true,
        };
        tracing::info!(queue = %bound.queue, consumer_tag = %options.consumer_tag, "Starting consumer");
        let consumer_tag = match channel.consume(&bound.queue, &options).await {
            Ok(tag) => tag,
            Err(e) => return self.escalate(&mut connection, e).await,
        };

        self.set_status(|s| {
            s.consuming = true;
            s.sessions += 1;
        });

        match self.consumer.run(&mut channel, stop).await {
            ConsumeEnd::Stopped => {
                self.set_status(|s| {
                    s.state = SupervisorState::Closing;
                    s.consuming = false;
                });

                tracing::info!(consumer_tag = %consumer_tag, "Cancelling consumer");
                if let Err(e) = channel.cancel(&consumer_tag).await {
                    tracing::debug!(error = %e, "Cancel failed");
                }
                self.close_channel(&mut channel).await;
                self.close_connection(&mut connection).await;
                SessionEnd::Stopped
            }
            ConsumeEnd::Failed(BrokerError::ConnectionClosed(reason)) => {
                SessionEnd::Failed(BrokerError::ConnectionClosed(reason))
            }
            ConsumeEnd::Failed(e @ BrokerError::ConsumerCancelled(_)) => {
                tracing::info!(error = %e, "Consumer was cancelled remotely, closing channel");
                self.close_channel(&mut channel).await;
                self.escalate(&mut connection, e).await
            }
            ConsumeEnd::Failed(e) => self.escalate(&mut connection, e).await,
        }
    }

    /// Turn a channel-level failure into a connection restart
    async fn escalate(&self, connection: &mut C::Connection, error: BrokerError) -> SessionEnd {
        self.set_status(|s| {
            s.channel = ChannelState::Closed;
            s.consuming = false;
        });

        if error.is_channel_level() {
            tracing::warn!(error = %error, "Channel was closed, closing connection");
        }
        self.close_connection(connection).await;
        SessionEnd::Failed(error)
    }

    async fn close_channel<Ch: BrokerChannel>(&self, channel: &mut Ch) {
        tracing::info!("Closing the channel");
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Channel close failed");
        }
        self.set_status(|s| s.channel = ChannelState::Closed);
    }

    async fn close_connection(&self, connection: &mut C::Connection) {
        tracing::info!("Closing connection");
        if let Err(e) = connection.close().await {
            tracing::debug!(error = %e, "Connection close failed");
        }
    }

    fn set_status(&self, update: impl FnOnce(&mut SupervisorStatus)) {
        self.shared.status.send_modify(update);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::{BrokerOp, MemoryBroker, MemoryConnector};

    fn supervisor(broker: &MemoryBroker) -> ConnectionSupervisor<MemoryConnector> {
        ConnectionSupervisor::new(
            broker.connector(),
            BrokerConfig::default(),
            ChannelKeyResolver::default(),
            Arc::new(SubscriberRegistry::new()),
        )
    }

    fn count(ops: &[BrokerOp], pred: impl Fn(&BrokerOp) -> bool) -> usize {
        ops.iter().filter(|op| pred(op)).count()
    }

    fn consuming(sessions: u64) -> impl FnMut(&SupervisorStatus) -> bool {
        move |s| s.consuming && s.sessions == sessions
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_consumes() {
        let broker = MemoryBroker::new();
        let (handle, _task) = supervisor(&broker).spawn();

        let status = handle.wait_for(consuming(1)).await;
        assert_eq!(status.state, SupervisorState::Open);
        assert_eq!(status.channel, ChannelState::Open);
        assert_eq!(broker.consumer_count("text"), 1);
        assert!(broker.is_bound("text", "test-exchange"));

        let ops = broker.ops();
        assert!(ops.iter().any(|op| matches!(
            op,
            BrokerOp::Consume { no_ack: true, consumer_tag, .. } if consumer_tag == "amqp-relay-1"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_connection_drop() {
        let broker = MemoryBroker::new();
        let (handle, _task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        let dropped_at = tokio::time::Instant::now();
        broker.drop_connections("connection reset");

        let status = handle
            .wait_for(|s| s.state == SupervisorState::Disconnected)
            .await;
        assert!(!status.consuming);

        handle.wait_for(consuming(2)).await;
        assert!(dropped_at.elapsed() >= Duration::from_secs(5));

        // Topology was declared again before the second consume
        let ops = broker.ops();
        let second_consume = ops
            .iter()
            .rposition(|op| matches!(op, BrokerOp::Consume { .. }))
            .unwrap();
        let second_connect = ops
            .iter()
            .rposition(|op| matches!(op, BrokerOp::Connect { .. }))
            .unwrap();
        let redeclared = &ops[second_connect..second_consume];
        assert_eq!(
            count(redeclared, |op| matches!(op, BrokerOp::DeclareExchange { .. })),
            1
        );
        assert_eq!(
            count(redeclared, |op| matches!(op, BrokerOp::DeclareQueue { .. })),
            1
        );
        assert_eq!(
            count(redeclared, |op| matches!(op, BrokerOp::BindQueue { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_suppresses_reconnect() {
        let broker = MemoryBroker::new();
        let (handle, task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        handle.stop();
        handle.stop();
        task.await.unwrap();

        assert_eq!(handle.state(), SupervisorState::Stopped);
        assert_eq!(broker.connection_count(), 0);

        // A close event after stop changes nothing
        broker.drop_connections("late close");
        tokio::time::sleep(Duration::from_secs(60)).await;

        let ops = broker.ops();
        assert_eq!(count(&ops, |op| matches!(op, BrokerOp::Connect { .. })), 1);
        assert_eq!(handle.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sequence_order() {
        let broker = MemoryBroker::new();
        let (handle, task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        handle.stop();
        task.await.unwrap();

        let ops = broker.ops();
        let tail: Vec<_> = ops.iter().rev().take(3).rev().collect();
        assert!(matches!(tail[0], BrokerOp::Cancel { .. }));
        assert!(matches!(tail[1], BrokerOp::CloseChannel { .. }));
        assert!(matches!(tail[2], BrokerOp::CloseConnection { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_reconnect_delay() {
        let broker = MemoryBroker::new();
        let (handle, task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        broker.drop_connections("gone");
        handle
            .wait_for(|s| s.state == SupervisorState::Disconnected)
            .await;
        handle.stop();
        task.await.unwrap();

        let ops = broker.ops();
        assert_eq!(count(&ops, |op| matches!(op, BrokerOp::Connect { .. })), 1);
        assert_eq!(handle.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run() {
        let broker = MemoryBroker::new();
        let supervisor = supervisor(&broker);
        let handle = supervisor.handle();
        handle.stop();
        assert!(handle.is_stopping());

        supervisor.run().await;

        assert_eq!(handle.state(), SupervisorState::Stopped);
        assert!(broker.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_refused_connects() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(3);
        let supervisor = supervisor(&broker);
        let stats = Arc::clone(supervisor.stats());
        let (handle, _task) = supervisor.spawn();

        handle.wait_for(consuming(1)).await;

        let snap = stats.snapshot();
        assert_eq!(snap.reconnects_scheduled, 3);
        assert_eq!(snap.connections_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_close_escalates_to_connection_restart() {
        let broker = MemoryBroker::new();
        let (handle, _task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        broker.close_channels("PRECONDITION_FAILED");

        handle.wait_for(consuming(2)).await;
        let ops = broker.ops();
        assert_eq!(
            count(&ops, |op| matches!(op, BrokerOp::CloseConnection { connection: 1 })),
            1
        );
        assert_eq!(count(&ops, |op| matches!(op, BrokerOp::Connect { .. })), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancel_restarts_connection() {
        let broker = MemoryBroker::new();
        let (handle, _task) = supervisor(&broker).spawn();
        handle.wait_for(consuming(1)).await;

        broker.cancel_consumers();

        handle.wait_for(consuming(2)).await;
        let ops = broker.ops();
        assert!(ops
            .iter()
            .any(|op| matches!(op, BrokerOp::CloseChannel { connection: 1, .. })));
        assert!(ops
            .iter()
            .any(|op| matches!(op, BrokerOp::CloseConnection { connection: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_topology_keeps_retrying() {
        let broker = MemoryBroker::new();

        // Someone else declared the exchange with different parameters
        {
            let mut conn = broker.connector().connect().await.unwrap();
            let mut channel = conn.open_channel().await.unwrap();
            let mut other = crate::broker::Topology::default();
            other.exchange.auto_delete = false;
            other.declare(&mut channel).await.unwrap();
        }

        let supervisor = supervisor(&broker);
        let stats = Arc::clone(supervisor.stats());
        let (handle, task) = supervisor.spawn();

        tokio::time::sleep(Duration::from_secs(12)).await;
        let status = handle.status();
        assert!(!status.consuming);
        assert_eq!(status.sessions, 0);
        assert!(stats.snapshot().reconnects_scheduled >= 2);

        handle.stop();
        task.await.unwrap();
        assert_eq!(handle.state(), SupervisorState::Stopped);
    }
}
