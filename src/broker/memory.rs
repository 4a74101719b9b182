//! In-process broker
//!
//! Models the parts of an AMQP broker the relay relies on: exchanges, queues,
//! bindings, consumers with no-ack delivery, and the channel/connection close
//! semantics (a conflicting redeclare closes the channel). Faults can be
//! injected to exercise reconnect paths, and every operation is recorded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::BrokerError;

use super::config::{ExchangeSpec, QueueSpec};
use super::{BrokerChannel, BrokerConnection, BrokerConnector, ConsumeOptions, RawDelivery};

type DeliveryTx = mpsc::UnboundedSender<Result<RawDelivery, BrokerError>>;
type DeliveryRx = mpsc::UnboundedReceiver<Result<RawDelivery, BrokerError>>;

/// Operation recorded by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    /// Connection accepted
    Connect {
        connection: u64,
    },
    /// Channel opened on a connection
    OpenChannel {
        connection: u64,
        channel: u64,
    },
    /// Exchange declared (or redeclared)
    DeclareExchange {
        connection: u64,
        name: String,
    },
    /// Queue declared; `name` is the resolved name
    DeclareQueue {
        connection: u64,
        name: String,
    },
    /// Queue bound to an exchange
    BindQueue {
        connection: u64,
        queue: String,
        exchange: String,
    },
    /// Consumer started on a queue
    Consume {
        connection: u64,
        queue: String,
        consumer_tag: String,
        no_ack: bool,
    },
    /// Consumer cancelled by the client
    Cancel {
        connection: u64,
        consumer_tag: String,
    },
    /// Channel closed by the client
    CloseChannel {
        connection: u64,
        channel: u64,
    },
    /// Connection closed by the client
    CloseConnection {
        connection: u64,
    },
}

struct Consumer {
    connection: u64,
    channel: u64,
    tag: String,
    tx: DeliveryTx,
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    pending: VecDeque<RawDelivery>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    next_delivery_tag: u64,
    refuse_connects: usize,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    /// (queue, exchange)
    bindings: HashSet<(String, String)>,
    /// connection id -> channel id -> delivery sender
    connections: HashMap<u64, HashMap<u64, DeliveryTx>>,
    ops: Vec<BrokerOp>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_open(&self, connection: u64, channel: u64) -> Result<(), BrokerError> {
        match self.connections.get(&connection) {
            None => Err(BrokerError::ConnectionClosed("connection is closed".into())),
            Some(channels) if !channels.contains_key(&channel) => {
                Err(BrokerError::ChannelClosed("channel is closed".into()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Broker-initiated channel close
    fn fail_channel(&mut self, connection: u64, channel: u64, error: BrokerError) {
        if let Some(tx) = self
            .connections
            .get_mut(&connection)
            .and_then(|channels| channels.remove(&channel))
        {
            let _ = tx.send(Err(error));
        }
        self.drop_consumers(|c| c.connection == connection && c.channel == channel);
    }

    fn drop_consumers(&mut self, mut pred: impl FnMut(&Consumer) -> bool) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| !pred(c));
        }
    }

    fn remove_connection(&mut self, connection: u64, error: Option<BrokerError>) {
        if let Some(channels) = self.connections.remove(&connection) {
            if let Some(error) = error {
                for tx in channels.values() {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
        self.drop_consumers(|c| c.connection == connection);

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);

        let unbound: Vec<String> = self
            .bindings
            .iter()
            .filter(|(queue, _)| queue == name)
            .map(|(_, exchange)| exchange.clone())
            .collect();
        self.bindings.retain(|(queue, _)| queue != name);

        // Auto-delete exchanges go away with their last binding
        for exchange in unbound {
            let still_bound = self.bindings.iter().any(|(_, e)| *e == exchange);
            let auto_delete = self
                .exchanges
                .get(&exchange)
                .map(|spec| spec.auto_delete)
                .unwrap_or(false);
            if auto_delete && !still_bound {
                self.exchanges.remove(&exchange);
            }
        }
    }

    fn route(&mut self, queue_name: &str, delivery: RawDelivery) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let mut delivery = delivery;
        while !queue.consumers.is_empty() {
            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            match queue.consumers[idx].tx.send(Ok(delivery)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver gone without a close; forget the consumer
                    queue.consumers.remove(idx);
                    match returned {
                        Ok(returned) => delivery = returned,
                        Err(_) => return,
                    }
                }
            }
        }

        queue.pending.push_back(delivery);
    }
}

/// In-process broker shared by cloning
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector opening connections to this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Publish a message to an exchange.
    ///
    /// Returns the number of queues the message was routed to. Publishing to
    /// an unknown exchange routes nowhere.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: impl Into<Bytes>) -> usize {
        let mut state = self.state();
        if !state.exchanges.contains_key(exchange) {
            tracing::debug!(exchange = %exchange, "Publish to unknown exchange dropped");
            return 0;
        }

        let body = body.into();
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, e)| e == exchange)
            .map(|(q, _)| q.clone())
            .collect();

        for queue in &targets {
            state.next_delivery_tag += 1;
            let delivery = RawDelivery {
                delivery_tag: state.next_delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                body: body.clone(),
            };
            state.route(queue, delivery);
        }

        targets.len()
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_connects(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Close every connection as if the network dropped
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.remove_connection(id, Some(BrokerError::ConnectionClosed(reason.to_string())));
        }
    }

    /// Close every channel from the broker side, leaving connections open
    pub fn close_channels(&self, reason: &str) {
        let mut state = self.state();
        let channels: Vec<(u64, u64)> = state
            .connections
            .iter()
            .flat_map(|(conn, chans)| chans.keys().map(move |ch| (*conn, *ch)))
            .collect();
        for (conn, ch) in channels {
            state.fail_channel(conn, ch, BrokerError::ChannelClosed(reason.to_string()));
        }
    }

    /// Cancel every consumer from the broker side
    pub fn cancel_consumers(&self) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            for consumer in queue.consumers.drain(..) {
                let _ = consumer
                    .tx
                    .send(Err(BrokerError::ConsumerCancelled(consumer.tag.clone())));
            }
        }
    }

    /// Recorded operations, oldest first
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state().ops.clone()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Number of consumers on a queue
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Number of messages waiting in a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Whether an exchange exists
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    /// Whether `queue` is bound to `exchange`
    pub fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.state()
            .bindings
            .contains(&(queue.to_string(), exchange.to_string()))
    }
}

/// Opens [`MemoryConnection`]s
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl BrokerConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BrokerError> {
        let mut state = self.broker.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }

        let id = state.next_id();
        state.connections.insert(id, HashMap::new());
        state.ops.push(BrokerOp::Connect { connection: id });

        Ok(MemoryConnection {
            broker: self.broker.clone(),
            id,
        })
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryConnection {
    /// Connection id as recorded in [`BrokerOp`]s
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&mut self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed("connection is closed".into()));
        }

        let channel = state.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(channels) = state.connections.get_mut(&self.id) {
            channels.insert(channel, tx);
        }
        state.ops.push(BrokerOp::OpenChannel {
            connection: self.id,
            channel,
        });

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id: channel,
            rx,
        })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if state.connections.contains_key(&self.id) {
            state.remove_connection(self.id, None);
            state.ops.push(BrokerOp::CloseConnection {
                connection: self.id,
            });
        }
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    id: u64,
    rx: DeliveryRx,
}

impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.check_open(self.connection, self.id)?;
        state.ops.push(BrokerOp::DeclareExchange {
            connection: self.connection,
            name: spec.name.clone(),
        });

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing != spec {
                let error = BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    spec.name
                ));
                state.fail_channel(self.connection, self.id, error.clone());
                return Err(error);
            }
            return Ok(());
        }

        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let mut state = self.broker.state();
        state.check_open(self.connection, self.id)?;

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            spec.name.clone()
        };
        state.ops.push(BrokerOp::DeclareQueue {
            connection: self.connection,
            name: name.clone(),
        });

        if let Some(existing) = state.queues.get(&name) {
            let error = if existing.spec != *spec {
                Some(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{}'",
                    name
                )))
            } else if existing.owner.is_some_and(|owner| owner != self.connection) {
                Some(BrokerError::ChannelClosed(format!(
                    "queue '{}' is locked by another connection",
                    name
                )))
            } else {
                None
            };

            if let Some(error) = error {
                state.fail_channel(self.connection, self.id, error.clone());
                return Err(error);
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                spec: spec.clone(),
                owner: spec.exclusive.then_some(self.connection),
                pending: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        _binding_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.check_open(self.connection, self.id)?;
        state.ops.push(BrokerOp::BindQueue {
            connection: self.connection,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
        });

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            let error = BrokerError::ChannelClosed(format!(
                "no queue '{}' or exchange '{}'",
                queue, exchange
            ));
            state.fail_channel(self.connection, self.id, error.clone());
            return Err(error);
        }

        state
            .bindings
            .insert((queue.to_string(), exchange.to_string()));
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<String, BrokerError> {
        let mut state = self.broker.state();
        state.check_open(self.connection, self.id)?;
        state.ops.push(BrokerOp::Consume {
            connection: self.connection,
            queue: queue.to_string(),
            consumer_tag: options.consumer_tag.clone(),
            no_ack: options.no_ack,
        });

        if !state.queues.contains_key(queue) {
            let error = BrokerError::ChannelClosed(format!("no queue '{}'", queue));
            state.fail_channel(self.connection, self.id, error.clone());
            return Err(error);
        }

        let tx = state
            .connections
            .get(&self.connection)
            .and_then(|channels| channels.get(&self.id))
            .cloned()
            .ok_or(BrokerError::NotConnected)?;

        if let Some(queue_state) = state.queues.get_mut(queue) {
            // Messages that arrived while nobody was consuming
            while let Some(delivery) = queue_state.pending.pop_front() {
                let _ = tx.send(Ok(delivery));
            }

            queue_state.consumers.push(Consumer {
                connection: self.connection,
                channel: self.id,
                tag: options.consumer_tag.clone(),
                tx,
            });
        }

        Ok(options.consumer_tag.clone())
    }

    async fn next_delivery(&mut self) -> Result<RawDelivery, BrokerError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(BrokerError::ChannelClosed("channel is closed".into())),
        }
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.check_open(self.connection, self.id)?;
        state.ops.push(BrokerOp::Cancel {
            connection: self.connection,
            consumer_tag: consumer_tag.to_string(),
        });

        let (connection, channel) = (self.connection, self.id);
        state.drop_consumers(|c| {
            c.connection == connection && c.channel == channel && c.tag == consumer_tag
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        let removed = state
            .connections
            .get_mut(&self.connection)
            .and_then(|channels| channels.remove(&self.id))
            .is_some();

        if removed {
            let (connection, channel) = (self.connection, self.id);
            state.drop_consumers(|c| c.connection == connection && c.channel == channel);
            state.ops.push(BrokerOp::CloseChannel {
                connection: self.connection,
                channel: self.id,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::config::Topology;

    fn no_ack(tag: &str) -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: tag.to_string(),
            no_ack: true,
        }
    }

    async fn bound_channel(broker: &MemoryBroker) -> (MemoryConnection, MemoryChannel) {
        let mut conn = broker.connector().connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        Topology::default().declare(&mut channel).await.unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let broker = MemoryBroker::new();
        let (_conn, mut channel) = bound_channel(&broker).await;
        channel.consume("text", &no_ack("c1")).await.unwrap();

        assert_eq!(broker.publish("test-exchange", "orders.1", "{}"), 1);

        let delivery = channel.next_delivery().await.unwrap();
        assert_eq!(delivery.routing_key, "orders.1");
        assert_eq!(delivery.exchange, "test-exchange");
        assert_eq!(delivery.body, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn test_pending_flushed_to_new_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, mut channel) = bound_channel(&broker).await;

        broker.publish("test-exchange", "a.1", "1");
        broker.publish("test-exchange", "a.2", "2");
        assert_eq!(broker.queue_depth("text"), 2);

        channel.consume("text", &no_ack("c1")).await.unwrap();
        assert_eq!(broker.queue_depth("text"), 0);
        assert_eq!(channel.next_delivery().await.unwrap().routing_key, "a.1");
        assert_eq!(channel.next_delivery().await.unwrap().routing_key, "a.2");
    }

    #[tokio::test]
    async fn test_shared_queue_round_robin() {
        let broker = MemoryBroker::new();
        let (_c1, mut ch1) = bound_channel(&broker).await;
        let (_c2, mut ch2) = bound_channel(&broker).await;
        ch1.consume("text", &no_ack("a")).await.unwrap();
        ch2.consume("text", &no_ack("b")).await.unwrap();
        assert_eq!(broker.consumer_count("text"), 2);

        for i in 0..4 {
            broker.publish("test-exchange", &format!("k.{}", i), "0");
        }

        // Each consumer got half, none got everything
        let first = ch1.next_delivery().await.unwrap();
        let second = ch2.next_delivery().await.unwrap();
        assert_ne!(first.routing_key, second.routing_key);
        ch1.next_delivery().await.unwrap();
        ch2.next_delivery().await.unwrap();
        assert_eq!(broker.queue_depth("text"), 0);
    }

    #[tokio::test]
    async fn test_drop_connections_notifies_channel() {
        let broker = MemoryBroker::new();
        let (_conn, mut channel) = bound_channel(&broker).await;
        channel.consume("text", &no_ack("c1")).await.unwrap();

        broker.drop_connections("reset by peer");

        let err = channel.next_delivery().await.unwrap_err();
        assert_eq!(err, BrokerError::ConnectionClosed("reset by peer".into()));
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(broker.consumer_count("text"), 0);
        // Shared queue outlives the connection
        assert!(broker.is_bound("text", "test-exchange"));
    }

    #[tokio::test]
    async fn test_close_channels_keeps_connection() {
        let broker = MemoryBroker::new();
        let (mut conn, mut channel) = bound_channel(&broker).await;

        broker.close_channels("forced");

        let err = channel.next_delivery().await.unwrap_err();
        assert!(err.is_channel_level());
        assert_eq!(broker.connection_count(), 1);
        assert!(conn.open_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, mut channel) = bound_channel(&broker).await;
        channel.consume("text", &no_ack("c1")).await.unwrap();

        broker.cancel_consumers();

        let err = channel.next_delivery().await.unwrap_err();
        assert_eq!(err, BrokerError::ConsumerCancelled("c1".into()));
    }

    #[tokio::test]
    async fn test_refuse_connects() {
        let broker = MemoryBroker::new();
        broker.refuse_connects(2);

        let connector = broker.connector();
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryBroker::new();
        let topology = Topology::fanout(
            "test-exchange",
            "",
            crate::broker::config::QueueMode::PerInstance,
        );

        let mut conn = broker.connector().connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        let bound = topology.declare(&mut channel).await.unwrap();
        assert!(broker.is_bound(&bound.queue, "test-exchange"));

        conn.close().await.unwrap();

        assert!(!broker.is_bound(&bound.queue, "test-exchange"));
        // Auto-delete exchange lost its last binding
        assert!(!broker.has_exchange("test-exchange"));
    }

    #[tokio::test]
    async fn test_ops_on_closed_channel_fail() {
        let broker = MemoryBroker::new();
        let (_conn, mut channel) = bound_channel(&broker).await;
        channel.close().await.unwrap();

        let err = channel.consume("text", &no_ack("c1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::ChannelClosed(_)));
        // Closing twice is fine
        assert!(channel.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_unknown_exchange() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("nowhere", "a.1", "{}"), 0);
    }
}
