//! Fire-and-forget domain event publishing.

use super::{Broker, Message, PublishError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const HEADER_EVENT_TYPE: &str = "x-event-type";
pub const HEADER_EVENT_VERSION: &str = "x-event-version";

/// A versioned JSON payload. The type and version travel as headers so
/// consumers can route or upcast without parsing the body.
pub trait DomainEvent: Serialize + Send + Sync {
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u16 {
        1
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize `event` and hand it to the broker. Returns once the broker
    /// accepted it for routing; delivery to a consumer is the queue's concern.
    ///
    /// # Errors
    /// Returns [`PublishError`] if serialization fails, the channel is closed
    /// or the exchange does not exist. Nothing is retried here.
    #[instrument(skip(self, event), fields(event_type = event.event_type()))]
    pub async fn publish<E: DomainEvent>(
        &self,
        exchange: &str,
        routing_key: &str,
        event: &E,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(event)?;
        let message = Message::json(body)
            .with_header(HEADER_EVENT_TYPE, event.event_type())
            .with_header(HEADER_EVENT_VERSION, event.version().to_string());

        self.broker.publish(exchange, routing_key, message).await?;
        debug!("event published");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::{Binding, ExchangeKind, ExchangeSpec, MemoryBroker, QueueSpec};
    use serde::ser::Error as _;

    #[derive(Serialize)]
    struct Registered {
        email: &'static str,
    }

    impl DomainEvent for Registered {
        fn event_type(&self) -> &'static str {
            "user.registered"
        }
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("boom"))
        }
    }

    impl DomainEvent for Unserializable {
        fn event_type(&self) -> &'static str {
            "broken"
        }

        fn version(&self) -> u16 {
            2
        }
    }

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::durable("user_exchange", ExchangeKind::Topic))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::durable("user.registration"))
            .await
            .unwrap();
        broker
            .bind_queue(&Binding::new(
                "user.registration",
                "user_exchange",
                "user.registration",
            ))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_sets_headers_and_body() {
        let broker = broker().await;
        let publisher = EventPublisher::new(Arc::new(broker.clone()));

        publisher
            .publish(
                "user_exchange",
                "user.registration",
                &Registered { email: "a@x.com" },
            )
            .await
            .unwrap();

        let messages = broker.take_ready("user.registration").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].header(HEADER_EVENT_TYPE), Some("user.registered"));
        assert_eq!(messages[0].header(HEADER_EVENT_VERSION), Some("1"));
        assert_eq!(messages[0].body, br#"{"email":"a@x.com"}"#.to_vec());
    }

    #[tokio::test]
    async fn serialization_failure_is_reported() {
        let broker = broker().await;
        let publisher = EventPublisher::new(Arc::new(broker.clone()));
        let err = publisher
            .publish("user_exchange", "user.registration", &Unserializable)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Serialize(_)));
        assert_eq!(broker.queue_depth("user.registration").await, Some(0));
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let broker = broker().await;
        broker.close().await.unwrap();
        let publisher = EventPublisher::new(Arc::new(broker));
        let err = publisher
            .publish(
                "user_exchange",
                "user.registration",
                &Registered { email: "a@x.com" },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ChannelClosed));
    }
}
