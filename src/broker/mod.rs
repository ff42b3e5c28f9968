//! Broker seam: the messaging primitives every other component is built on.
//!
//! Components never hold a process-wide connection. They receive an
//! `Arc<dyn Broker>` at construction time, which is either an [`AmqpBroker`]
//! (RabbitMQ over AMQP 0-9-1) or a [`MemoryBroker`] that reproduces the same
//! routing, TTL and dead-letter semantics in-process.
//!
//! On top of the seam sit:
//! - [`topology`]: idempotent declaration of exchanges, queues and bindings.
//! - [`dead_letter`]: the dead-letter exchange/queue pair and queue arguments.
//! - [`publisher`]: fire-and-forget domain event publishing.
//! - [`rpc`]: correlated request/response over a private reply queue.

pub mod amqp;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod routing;
pub mod rpc;
pub mod topology;

pub use self::amqp::AmqpBroker;
pub use self::error::{CallError, ConsumeError, DecodeError, PublishError, TopologyError};
pub use self::memory::MemoryBroker;

use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::info;
use url::Url;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Queue argument naming the exchange that receives expired/rejected messages.
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument holding the per-message TTL in milliseconds.
pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";

pub const HEADER_DEATH_REASON: &str = "x-first-death-reason";
pub const HEADER_DEATH_QUEUE: &str = "x-first-death-queue";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }

    /// Whether a binding declared with `pattern` receives a message published
    /// with `routing_key` on an exchange of this kind.
    #[must_use]
    pub fn routes(self, pattern: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => pattern == routing_key,
            Self::Fanout => true,
            Self::Topic => routing::topic_matches(pattern, routing_key),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    #[must_use]
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    /// A private, non-durable queue that lives as long as its consumer.
    #[must_use]
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// TTL as sent on the wire (`x-message-ttl` is an integer in milliseconds).
    #[must_use]
    pub fn message_ttl_millis(&self) -> Option<i32> {
        self.message_ttl
            .map(|ttl| i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// The subset of AMQP basic properties this service reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Message {
    /// A message with the JSON content type already set.
    #[must_use]
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            properties: Properties {
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                ..Properties::default()
            },
            body,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.properties.headers.get(key).map(String::as_str)
    }
}

/// Settles a delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), ConsumeError>;
    async fn reject(&self, requeue: bool) -> Result<(), ConsumeError>;
}

/// A message handed to a subscriber. It must be settled with [`Delivery::ack`]
/// or [`Delivery::reject`]; rejecting without requeue dead-letters it.
pub struct Delivery {
    pub message: Message,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[must_use]
    pub fn new(message: Message, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message,
            redelivered,
            acker,
        }
    }

    /// # Errors
    /// Returns an error if the channel that delivered the message is gone.
    pub async fn ack(self) -> Result<(), ConsumeError> {
        self.acker.ack().await
    }

    /// # Errors
    /// Returns an error if the channel that delivered the message is gone.
    pub async fn reject(self, requeue: bool) -> Result<(), ConsumeError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// A stream of deliveries from one queue. `None` means the subscription ended
/// (broker closed or channel lost).
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<Result<Delivery, ConsumeError>>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// # Errors
    /// Conflicting re-declaration or lost connectivity.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError>;

    /// # Errors
    /// Conflicting re-declaration or lost connectivity.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError>;

    /// # Errors
    /// Missing exchange/queue or lost connectivity.
    async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError>;

    /// Hand a message to the broker for routing. Returns once the broker has
    /// accepted it; there is no wait for consumers.
    ///
    /// # Errors
    /// The channel is closed or the exchange does not exist.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), PublishError>;

    /// # Errors
    /// The queue does not exist or the channel cannot be opened.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, ConsumeError>;

    /// # Errors
    /// Returns an error if the connection does not close cleanly.
    async fn close(&self) -> Result<(), ConsumeError>;
}

/// Open a broker from its URL: `amqp://`/`amqps://` connect to RabbitMQ,
/// `memory://` builds an in-process broker.
///
/// # Errors
/// Returns [`TopologyError::Connection`] if the broker is unreachable or the
/// scheme is not supported.
pub async fn connect(url: &Url) -> Result<Arc<dyn Broker>, TopologyError> {
    match url.scheme() {
        "amqp" | "amqps" => {
            let broker = AmqpBroker::connect(url.as_str()).await?;
            info!(host = url.host_str().unwrap_or("localhost"), "connected to AMQP broker");
            Ok(Arc::new(broker))
        }
        "memory" => {
            info!("using in-process broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        scheme => Err(TopologyError::Connection(format!(
            "unsupported broker scheme: {scheme}"
        ))),
    }
}
