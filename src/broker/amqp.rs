//! AMQP 0-9-1 backend (RabbitMQ) built on `lapin`

use futures_util::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Connection, ConnectionProperties, Consumer};

use crate::error::BrokerError;

use super::config::{BrokerConfig, ExchangeKind, ExchangeSpec, QueueSpec};
use super::{BrokerChannel, BrokerConnection, BrokerConnector, ConsumeOptions, RawDelivery};

const REPLY_SUCCESS: u16 = 200;

fn channel_error(e: lapin::Error) -> BrokerError {
    match e {
        lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::ProtocolError(_) => BrokerError::ChannelClosed(e.to_string()),
        other => BrokerError::ConnectionClosed(other.to_string()),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Structured URI for `config`; credentials are passed through unparsed
fn broker_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        ..AMQPUri::default()
    }
}

/// Connects to an AMQP broker with plain credentials
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: AMQPUri,
}

impl AmqpConnector {
    /// Create a connector for the broker described by `config`
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: broker_uri(config),
        }
    }
}

impl BrokerConnector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection, BrokerError> {
        let connection = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        Ok(AmqpConnection { connection })
    }
}

/// Open AMQP connection
pub struct AmqpConnection {
    connection: Connection,
}

impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&mut self) -> Result<AmqpChannel, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionClosed(e.to_string()))?;

        Ok(AmqpChannel {
            channel,
            consumer: None,
        })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "relay closing")
            .await
            .map_err(|e| BrokerError::ConnectionClosed(e.to_string()))
    }
}

/// Channel on an [`AmqpConnection`]
pub struct AmqpChannel {
    channel: lapin::Channel,
    consumer: Option<Consumer>,
}

impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(channel_error)?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<String, BrokerError> {
        let consume_options = BasicConsumeOptions {
            no_ack: options.no_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                consume_options,
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let tag = consumer.tag().as_str().to_string();
        self.consumer = Some(consumer);
        Ok(tag)
    }

    async fn next_delivery(&mut self) -> Result<RawDelivery, BrokerError> {
        let consumer = self.consumer.as_mut().ok_or(BrokerError::NotConnected)?;

        match consumer.next().await {
            Some(Ok(delivery)) => Ok(RawDelivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                redelivered: delivery.redelivered,
                body: delivery.data.into(),
            }),
            Some(Err(e)) => Err(channel_error(e)),
            None => Err(BrokerError::ConsumerCancelled(
                consumer.tag().as_str().to_string(),
            )),
        }
    }

    async fn cancel(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error)?;
        self.consumer = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer = None;
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "relay closing")
            .await
            .map_err(channel_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_keeps_credentials_intact() {
        let config = BrokerConfig::with_host("rabbit")
            .port(5673)
            .credentials("relay", "p@ss/w:rd");
        let uri = AmqpConnector::new(&config).uri;

        assert_eq!(uri.authority.host, "rabbit");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "relay");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn test_rendered_uri_parses_to_same_host() {
        let config = BrokerConfig::with_host("rabbit").credentials("relay", "p@ss/w:rd");
        let parsed: AMQPUri = config.amqp_uri().parse().unwrap();

        assert_eq!(parsed.authority.host, "rabbit");
        assert_eq!(parsed.authority.port, 5672);
        assert_eq!(parsed.authority.userinfo.username, "relay");
    }
}
