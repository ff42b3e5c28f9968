//! Exchange, queue and binding declarations.
//!
//! [`declare`] must complete before any publisher or consumer starts. Every
//! call is idempotent: declaring what already exists with the same arguments
//! is a no-op, while different arguments fail with [`TopologyError::Conflict`]
//! and leave the existing broker objects untouched.

use super::{
    dead_letter::DeadLetterPolicy, Binding, Broker, ExchangeKind, ExchangeSpec, QueueSpec,
    TopologyError,
};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, info, instrument};

pub const USER_EXCHANGE: &str = "user_exchange";
pub const REGISTRATION_QUEUE: &str = "user.registration";
pub const REGISTRATION_ROUTING_KEY: &str = "user.registration";

pub const AUTH_EXCHANGE: &str = "auth_exchange";
pub const LOGIN_VERIFICATION_QUEUE: &str = "login_verification";
pub const LOGIN_VERIFICATION_ROUTING_KEY: &str = "login.verification";
pub const LOGIN_RESPONSE_QUEUE: &str = "login_response";
pub const LOGIN_RESPONSE_ROUTING_KEY: &str = "login.response";

/// Names used to build the service topology. Defaults match the names already
/// deployed on the shared broker.
#[derive(Clone, Debug)]
pub struct TopologyConfig {
    pub user_exchange: String,
    pub registration_queue: String,
    pub registration_routing_key: String,
    pub auth_exchange: String,
    pub verification_queue: String,
    pub verification_routing_key: String,
    pub response_queue: String,
    pub response_routing_key: String,
    pub dead_letter: DeadLetterPolicy,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            user_exchange: USER_EXCHANGE.to_string(),
            registration_queue: REGISTRATION_QUEUE.to_string(),
            registration_routing_key: REGISTRATION_ROUTING_KEY.to_string(),
            auth_exchange: AUTH_EXCHANGE.to_string(),
            verification_queue: LOGIN_VERIFICATION_QUEUE.to_string(),
            verification_routing_key: LOGIN_VERIFICATION_ROUTING_KEY.to_string(),
            response_queue: LOGIN_RESPONSE_QUEUE.to_string(),
            response_routing_key: LOGIN_RESPONSE_ROUTING_KEY.to_string(),
            dead_letter: DeadLetterPolicy::default(),
        }
    }
}

impl TopologyConfig {
    #[must_use]
    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.dead_letter = self.dead_letter.with_message_ttl(ttl);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The registration/login topology: registration events on a topic
    /// exchange, login requests and replies on another, all primary queues
    /// dead-lettered.
    #[must_use]
    pub fn registration(config: &TopologyConfig) -> Self {
        let dead_letter = &config.dead_letter;
        Self::default()
            .with_exchange(dead_letter.exchange_spec())
            .with_queue(dead_letter.queue_spec())
            .with_binding(dead_letter.binding())
            .with_exchange(ExchangeSpec::durable(
                &config.user_exchange,
                ExchangeKind::Topic,
            ))
            .with_queue(dead_letter.apply(QueueSpec::durable(&config.registration_queue)))
            .with_binding(Binding::new(
                &config.registration_queue,
                &config.user_exchange,
                &config.registration_routing_key,
            ))
            .with_exchange(ExchangeSpec::durable(
                &config.auth_exchange,
                ExchangeKind::Topic,
            ))
            .with_queue(dead_letter.apply(QueueSpec::durable(&config.verification_queue)))
            .with_binding(Binding::new(
                &config.verification_queue,
                &config.auth_exchange,
                &config.verification_routing_key,
            ))
            .with_queue(dead_letter.apply(QueueSpec::durable(&config.response_queue)))
            .with_binding(Binding::new(
                &config.response_queue,
                &config.auth_exchange,
                &config.response_routing_key,
            ))
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchanges.push(exchange);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Check that every binding and dead-letter target refers to something
    /// declared in the same topology.
    ///
    /// # Errors
    /// Returns [`TopologyError::NotFound`] for the first dangling reference.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let exchanges: HashSet<&str> = self.exchanges.iter().map(|e| e.name.as_str()).collect();
        let queues: HashSet<&str> = self.queues.iter().map(|q| q.name.as_str()).collect();

        for queue in &self.queues {
            if let Some(dlx) = &queue.dead_letter_exchange {
                if !exchanges.contains(dlx.as_str()) {
                    return Err(TopologyError::NotFound {
                        kind: "dead-letter exchange",
                        name: dlx.clone(),
                    });
                }
            }
        }

        for binding in &self.bindings {
            if !exchanges.contains(binding.exchange.as_str()) {
                return Err(TopologyError::NotFound {
                    kind: "exchange",
                    name: binding.exchange.clone(),
                });
            }
            if !queues.contains(binding.queue.as_str()) {
                return Err(TopologyError::NotFound {
                    kind: "queue",
                    name: binding.queue.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Declare exchanges, then queues, then bindings.
///
/// # Errors
/// Returns [`TopologyError`] if the topology is inconsistent, the broker is
/// unreachable, or an existing object was declared with different arguments.
#[instrument(skip_all)]
pub async fn declare(broker: &dyn Broker, topology: &Topology) -> Result<(), TopologyError> {
    topology.validate()?;

    for exchange in &topology.exchanges {
        broker.declare_exchange(exchange).await?;
        debug!(exchange = %exchange.name, kind = %exchange.kind, "exchange declared");
    }

    for queue in &topology.queues {
        broker.declare_queue(queue).await?;
        debug!(
            queue = %queue.name,
            dead_letter_exchange = queue.dead_letter_exchange.as_deref().unwrap_or(""),
            message_ttl_ms = queue.message_ttl_millis().unwrap_or_default(),
            "queue declared"
        );
    }

    for binding in &topology.bindings {
        broker.bind_queue(binding).await?;
        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "queue bound"
        );
    }

    info!(
        exchanges = topology.exchanges.len(),
        queues = topology.queues.len(),
        bindings = topology.bindings.len(),
        "broker topology declared"
    );

    Ok(())
}
