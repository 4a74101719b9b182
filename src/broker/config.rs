//! Broker configuration

use std::time::Duration;

/// Default exchange the relay consumes from
pub const DEFAULT_EXCHANGE: &str = "test-exchange";

/// Default shared queue name
pub const DEFAULT_QUEUE: &str = "text";

/// Default delay before reconnecting after an unexpected close
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Broker-side exchange type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Copy every message to every bound queue
    Fanout,
    /// Route on exact routing key
    Direct,
    /// Route on routing key patterns
    Topic,
    /// Route on headers
    Headers,
}

impl ExchangeKind {
    /// Protocol name of the exchange type
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: ExchangeKind,
    /// Survive a broker restart
    pub durable: bool,
    /// Delete once the last queue is unbound
    pub auto_delete: bool,
}

/// Queue declaration parameters
///
/// An empty `name` asks the broker to generate one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    /// Queue name, empty for a broker-generated one
    pub name: String,
    /// Survive a broker restart
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,
    /// Delete once the last consumer is gone
    pub auto_delete: bool,
}

/// How relay instances share the broker queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// All instances consume from one named queue. The broker round-robins
    /// messages between them, so each instance sees only a share.
    Shared,
    /// Each instance declares its own exclusive, server-named queue and
    /// receives a full copy of every message.
    PerInstance,
}

/// Exchange, queue and the binding between them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    /// Binding key (ignored by fan-out exchanges)
    pub binding_key: String,
}

impl Topology {
    /// Fan-out exchange bound to a queue according to `mode`
    pub fn fanout(exchange: impl Into<String>, queue: impl Into<String>, mode: QueueMode) -> Self {
        let queue = match mode {
            QueueMode::Shared => QueueSpec {
                name: queue.into(),
                durable: false,
                exclusive: false,
                auto_delete: false,
            },
            QueueMode::PerInstance => QueueSpec {
                name: String::new(),
                durable: false,
                exclusive: true,
                auto_delete: true,
            },
        };

        Self {
            exchange: ExchangeSpec {
                name: exchange.into(),
                kind: ExchangeKind::Fanout,
                durable: false,
                auto_delete: true,
            },
            queue,
            binding_key: String::new(),
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::fanout(DEFAULT_EXCHANGE, DEFAULT_QUEUE, QueueMode::Shared)
    }
}

/// Broker connection and consumption options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host name or address
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Virtual host
    pub virtual_host: String,

    /// Plain-auth user name
    pub username: String,

    /// Plain-auth password
    pub password: String,

    /// Delay between an unexpected close and the next connect attempt
    pub reconnect_delay: Duration,

    /// Consumer tag prefix; the session number is appended
    pub consumer_tag: String,

    /// Exchange/queue/binding declared on every new channel
    pub topology: Topology,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            consumer_tag: "amqp-relay".to_string(),
            topology: Topology::default(),
        }
    }
}

impl BrokerConfig {
    /// Create a config for the given host
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the virtual host
    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    /// Set plain credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the consumer tag prefix
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Replace the topology
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Switch between a shared queue and a per-instance queue
    pub fn queue_mode(mut self, mode: QueueMode) -> Self {
        let queue_name = match mode {
            QueueMode::Shared if self.topology.queue.name.is_empty() => DEFAULT_QUEUE.to_string(),
            _ => self.topology.queue.name.clone(),
        };
        let exchange = self.topology.exchange.name.clone();
        self.topology = Topology::fanout(exchange, queue_name, mode);
        self
    }

    /// Render as an `amqp://` URI.
    ///
    /// Every component is percent-encoded, so credentials may contain
    /// `@`, `:` or `/`.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            percent_encode(&self.username),
            percent_encode(&self.password),
            self.host,
            self.port,
            percent_encode(&self.virtual_host)
        )
    }
}

/// Percent-encode everything outside the URI unreserved set
fn percent_encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
