#![allow(clippy::unwrap_used)]

mod common;

use registrar::{
    api::handlers::register::UserRegistered,
    broker::{
        publisher::{EventPublisher, HEADER_EVENT_TYPE, HEADER_EVENT_VERSION},
        topology::{self, Topology, TopologyConfig},
        Broker, Message, MemoryBroker, QueueSpec, TopologyError, HEADER_DEATH_QUEUE,
        HEADER_DEATH_REASON,
    },
};
use std::{sync::Arc, time::Duration};

#[tokio::test]
async fn declaring_twice_is_idempotent() {
    let config = TopologyConfig::default();
    let broker = common::declared_broker(&config).await;

    topology::declare(broker.as_ref(), &Topology::registration(&config))
        .await
        .unwrap();

    assert_eq!(broker.exchange_count().await, 3);
    assert_eq!(broker.queue_count().await, 4);
    assert_eq!(broker.binding_count().await, 4);
}

#[tokio::test]
async fn queue_declared_with_other_arguments_is_a_conflict() {
    let config = TopologyConfig::default();
    let broker = MemoryBroker::new();
    broker
        .declare_queue(&QueueSpec::durable(&config.verification_queue))
        .await
        .unwrap();

    let err = topology::declare(&broker, &Topology::registration(&config))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TopologyError::Conflict { kind: "queue", ref name } if name == "login_verification"
    ));
}

#[tokio::test]
async fn registration_event_lands_on_registration_queue() {
    let config = TopologyConfig::default();
    let broker = common::declared_broker(&config).await;
    let publisher = EventPublisher::new(broker.clone());

    let event = UserRegistered {
        reg_no: "20261000".to_string(),
        name: "Ada".to_string(),
        email: "ada@example.com".to_string(),
        phone: "+15550100".to_string(),
        photo: None,
        documents: Vec::new(),
        created_at: chrono::Utc::now(),
    };
    publisher
        .publish(&config.user_exchange, &config.registration_routing_key, &event)
        .await
        .unwrap();

    let mut messages = broker.take_ready(&config.registration_queue).await;
    assert_eq!(messages.len(), 1);
    let message = messages.remove(0);
    assert_eq!(message.header(HEADER_EVENT_TYPE), Some("user.registered"));
    assert_eq!(message.header(HEADER_EVENT_VERSION), Some("1"));

    let decoded: UserRegistered = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(decoded, event);

    // login queues are untouched
    assert_eq!(broker.queue_depth(&config.verification_queue).await, Some(0));
}

#[tokio::test(start_paused = true)]
async fn expired_messages_move_to_dead_letter_queue() {
    let config = TopologyConfig::default().with_message_ttl(Some(Duration::from_secs(60)));
    let broker = common::declared_broker(&config).await;

    broker
        .publish(
            &config.auth_exchange,
            &config.verification_routing_key,
            Message::json(b"{}".to_vec()).with_correlation_id("abandoned"),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(broker.queue_depth(&config.verification_queue).await, Some(1));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(broker.queue_depth(&config.verification_queue).await, Some(0));

    let dead = broker.take_ready(&config.dead_letter.queue).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].properties.correlation_id.as_deref(), Some("abandoned"));
    assert_eq!(dead[0].header(HEADER_DEATH_REASON), Some("expired"));
    assert_eq!(dead[0].header(HEADER_DEATH_QUEUE), Some("login_verification"));
}

#[tokio::test(start_paused = true)]
async fn disabled_ttl_keeps_messages() {
    let config = TopologyConfig::default().with_message_ttl(None);
    let broker = Arc::new(MemoryBroker::new());
    topology::declare(broker.as_ref(), &Topology::registration(&config))
        .await
        .unwrap();

    broker
        .publish(
            &config.user_exchange,
            &config.registration_routing_key,
            Message::json(b"{}".to_vec()),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(broker.queue_depth(&config.registration_queue).await, Some(1));
    assert_eq!(broker.queue_depth(&config.dead_letter.queue).await, Some(0));
}
