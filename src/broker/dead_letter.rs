//! Dead-letter wiring: a fanout exchange bound to a durable queue, and the
//! queue arguments that point a primary queue at it.
//!
//! Nothing here inspects or replays dead letters. The broker moves expired and
//! rejected messages on its own once the arguments are in place.

use super::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};
use std::time::Duration;

pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "dead_letter_exchange";
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "dead_letter_queue";
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub exchange: String,
    pub queue: String,
    /// TTL applied to primary queues; `None` keeps messages until consumed.
    pub message_ttl: Option<Duration>,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
            queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
            message_ttl: Some(DEFAULT_MESSAGE_TTL),
        }
    }
}

impl DeadLetterPolicy {
    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }

    #[must_use]
    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::durable(&self.exchange, ExchangeKind::Fanout)
    }

    #[must_use]
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.queue)
    }

    /// Fanout exchanges ignore the routing key, so the binding uses an empty one.
    #[must_use]
    pub fn binding(&self) -> Binding {
        Binding::new(&self.queue, &self.exchange, "")
    }

    /// Attach the dead-letter exchange and TTL to a primary queue.
    #[must_use]
    pub fn apply(&self, queue: QueueSpec) -> QueueSpec {
        let queue = queue.with_dead_letter_exchange(&self.exchange);
        match self.message_ttl {
            Some(ttl) => queue.with_message_ttl(ttl),
            None => queue,
        }
    }
}
