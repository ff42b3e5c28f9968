//! RabbitMQ implementation of [`Broker`] over AMQP 0-9-1.
//!
//! Declarations run on a short-lived channel: a `PRECONDITION_FAILED` reply
//! closes the channel it arrived on, and the publish channel must survive it.
//! Every subscription gets its own channel so `basic.qos` applies per consumer.

use super::{
    Acknowledger, Binding, Broker, ConsumeError, Delivery, ExchangeKind, ExchangeSpec, Message,
    Properties, PublishError, QueueSpec, Subscription, TopologyError, ARG_DEAD_LETTER_EXCHANGE,
    ARG_MESSAGE_TTL,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Mutex<Channel>,
}

impl AmqpBroker {
    /// # Errors
    /// Returns [`TopologyError::Connection`] if the broker cannot be reached.
    pub async fn connect(uri: &str) -> Result<Self, TopologyError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(env!("CARGO_PKG_NAME").into());
        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|err| TopologyError::Connection(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| TopologyError::Connection(err.to_string()))?;

        Ok(Self {
            connection,
            publish_channel: Mutex::new(channel),
        })
    }

    async fn declaration_channel(&self) -> Result<Channel, TopologyError> {
        self.connection
            .create_channel()
            .await
            .map_err(|err| TopologyError::Connection(err.to_string()))
    }

    // Best effort: a conflicting declaration already closed the channel.
    async fn release(channel: Channel) {
        if channel.status().connected() {
            if let Err(err) = channel.close(200, "declared").await {
                debug!("failed to close declaration channel: {err}");
            }
        }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &queue.dead_letter_exchange {
        arguments.insert(
            ARG_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(ttl) = queue.message_ttl_millis() {
        arguments.insert(ARG_MESSAGE_TTL.into(), AMQPValue::LongInt(ttl));
    }
    arguments
}

fn declaration_error(kind: &'static str, name: &str, err: lapin::Error) -> TopologyError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => TopologyError::Conflict {
                kind,
                name: name.to_string(),
            },
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => TopologyError::NotFound {
                kind,
                name: name.to_string(),
            },
            _ => TopologyError::Refused {
                name: name.to_string(),
                reason: amqp.to_string(),
            },
        },
        _ => TopologyError::Connection(err.to_string()),
    }
}

fn publish_error(exchange: &str, err: lapin::Error) -> PublishError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            PublishError::ExchangeNotFound(exchange.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            PublishError::ChannelClosed
        }
        _ => PublishError::Rejected(err.to_string()),
    }
}

fn consume_error(queue: &str, err: lapin::Error) -> ConsumeError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            ConsumeError::QueueNotFound(queue.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            ConsumeError::ChannelClosed
        }
        _ => ConsumeError::Broker(err.to_string()),
    }
}

fn to_amqp_properties(properties: &Properties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(content_type.as_str().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.as_str().into());
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &properties.headers {
            headers.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        amqp = amqp.with_headers(headers);
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> Properties {
    let mut headers = BTreeMap::new();
    if let Some(table) = amqp.headers() {
        for (key, value) in table.inner() {
            // Only string headers are surfaced; x-death arrays and numbers are skipped.
            let value = match value {
                AMQPValue::LongString(value) => {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                }
                AMQPValue::ShortString(value) => value.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }

    Properties {
        content_type: amqp.content_type().as_ref().map(|value| value.as_str().to_string()),
        correlation_id: amqp.correlation_id().as_ref().map(|value| value.as_str().to_string()),
        reply_to: amqp.reply_to().as_ref().map(|value| value.as_str().to_string()),
        headers,
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        Self::release(channel).await;
        result.map_err(|err| declaration_error("exchange", &exchange.name, err))
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(queue),
            )
            .await;
        Self::release(channel).await;
        result
            .map(|declared| {
                debug!(
                    queue = %queue.name,
                    messages = declared.message_count(),
                    "queue ready"
                );
            })
            .map_err(|err| declaration_error("queue", &queue.name, err))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await;
        Self::release(channel).await;
        result.map_err(|err| declaration_error("binding", &binding.queue, err))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), PublishError> {
        let mut channel = self.publish_channel.lock().await;
        if !channel.status().connected() {
            if !self.connection.status().connected() {
                return Err(PublishError::ChannelClosed);
            }
            warn!("publish channel closed, reopening");
            *channel = self
                .connection
                .create_channel()
                .await
                .map_err(|err| publish_error(exchange, err))?;
        }

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(|err| publish_error(exchange, err))?
            .await
            .map_err(|err| publish_error(exchange, err))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, ConsumeError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| consume_error(queue, err))?;
        if prefetch > 0 {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| consume_error(queue, err))?;
        }

        let tag = format!("{}-{}", env!("CARGO_PKG_NAME"), Ulid::new());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| consume_error(queue, err))?;

        debug!(queue, consumer_tag = %tag, prefetch, "consumer started");

        Ok(Box::new(AmqpSubscription {
            _channel: channel,
            consumer,
        }))
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|err| ConsumeError::Broker(err.to_string()))?;
        info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpSubscription {
    // Keeps the consumer's channel open for as long as the subscription lives.
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, ConsumeError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)) => {
                return None;
            }
            Err(err) => return Some(Err(ConsumeError::Broker(err.to_string()))),
        };

        let message = Message {
            properties: from_amqp_properties(&delivery.properties),
            body: delivery.data,
        };
        Some(Ok(Delivery::new(
            message,
            delivery.redelivered,
            Box::new(AmqpAcker(delivery.acker)),
        )))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), ConsumeError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| consume_error("", err))
    }

    async fn reject(&self, requeue: bool) -> Result<(), ConsumeError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| consume_error("", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;
    use std::time::Duration;

    #[test]
    fn queue_arguments_carry_dead_letter_and_ttl() {
        let queue = QueueSpec::durable("user.registration")
            .with_dead_letter_exchange("dead_letter_exchange")
            .with_message_ttl(Duration::from_secs(60));
        let arguments = queue_arguments(&queue);
        let inner = arguments.inner();

        assert_eq!(
            inner.get(&ShortString::from(ARG_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from(ARG_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString("dead_letter_exchange".into()))
        );

        assert!(queue_arguments(&QueueSpec::durable("plain")).inner().is_empty());
    }

    #[test]
    fn properties_survive_conversion() {
        let message = Message::json(b"{}".to_vec())
            .with_correlation_id("c-1")
            .with_reply_to("login_response")
            .with_header("x-event-type", "user.registered");

        let amqp = to_amqp_properties(&message.properties);
        assert_eq!(amqp.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(from_amqp_properties(&amqp), message.properties);
    }
}
