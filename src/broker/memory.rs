//! In-process broker with AMQP semantics.
//!
//! Used by the test suite and by `memory://` development mode. It implements
//! the parts of RabbitMQ behaviour this service relies on:
//! - the default exchange (`""`) delivering straight to the queue named by the
//!   routing key, plus direct, topic and fanout exchanges;
//! - idempotent declarations that fail on conflicting arguments;
//! - per-queue message TTL and dead-lettering of expired messages and of
//!   deliveries rejected without requeue;
//! - requeue with the redelivered flag;
//! - auto-delete queues removed when their last subscription is dropped.
//!
//! Expiry is evaluated on every broker operation and by waiting subscribers,
//! so an expired message reaches its dead-letter queue even when nobody is
//! consuming the primary queue.

use super::{
    Acknowledger, Binding, Broker, ConsumeError, Delivery, ExchangeSpec, Message, PublishError,
    QueueSpec, Subscription, TopologyError, HEADER_DEATH_QUEUE, HEADER_DEATH_REASON,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{Mutex, Notify},
    time::{sleep_until, Instant},
};
use tracing::{debug, warn};

const DEATH_EXPIRED: &str = "expired";
const DEATH_REJECTED: &str = "rejected";

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    notify: Arc<Notify>,
    consumers: usize,
}

#[derive(Clone)]
struct Stored {
    message: Message,
    routing_key: String,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
            consumers: 0,
        }
    }

    fn enqueue(&mut self, message: Message, routing_key: &str, now: Instant) {
        let expires_at = self.spec.message_ttl.map(|ttl| now + ttl);
        self.ready.push_back(Stored {
            message,
            routing_key: routing_key.to_string(),
            expires_at,
            redelivered: false,
        });
        self.notify.notify_waiters();
    }
}

impl State {
    fn tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Route a message and return how many queues received it.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        now: Instant,
    ) -> Result<usize, PublishError> {
        if exchange.is_empty() {
            return Ok(self.queues.get_mut(routing_key).map_or(0, |queue| {
                queue.enqueue(message, routing_key, now);
                1
            }));
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind)
            .ok_or_else(|| PublishError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && kind.routes(&binding.routing_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        let mut delivered = 0;
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.enqueue(message.clone(), routing_key, now);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn dead_letter(&mut self, queue: &str, stored: Stored, reason: &str, now: Instant) {
        let dead_letter_exchange = self
            .queues
            .get(queue)
            .and_then(|state| state.spec.dead_letter_exchange.clone());

        let Some(exchange) = dead_letter_exchange else {
            debug!(queue, reason, "message discarded: queue has no dead-letter exchange");
            return;
        };

        let mut message = stored.message;
        message
            .properties
            .headers
            .entry(HEADER_DEATH_REASON.to_string())
            .or_insert_with(|| reason.to_string());
        message
            .properties
            .headers
            .entry(HEADER_DEATH_QUEUE.to_string())
            .or_insert_with(|| queue.to_string());

        match self.route(&exchange, &stored.routing_key, message, now) {
            Ok(0) => warn!(queue, %exchange, "dead letter was not routed to any queue"),
            Ok(_) => debug!(queue, %exchange, reason, "message dead-lettered"),
            Err(err) => warn!(queue, %exchange, "failed to dead-letter message: {err}"),
        }
    }

    /// Move every expired ready message to its dead-letter exchange.
    fn expire(&mut self, now: Instant) {
        let mut expired: Vec<(String, Stored)> = Vec::new();
        for (name, queue) in &mut self.queues {
            if queue.spec.message_ttl.is_none() {
                continue;
            }
            let mut kept = VecDeque::with_capacity(queue.ready.len());
            for stored in queue.ready.drain(..) {
                if stored.expires_at.is_some_and(|at| at <= now) {
                    expired.push((name.clone(), stored));
                } else {
                    kept.push_back(stored);
                }
            }
            queue.ready = kept;
        }

        for (queue, stored) in expired {
            self.dead_letter(&queue, stored, DEATH_EXPIRED, now);
        }
    }

    fn release_consumer(&mut self, queue: &str) {
        let remove = match self.queues.get_mut(queue) {
            Some(state) => {
                state.consumers = state.consumers.saturating_sub(1);
                state.spec.auto_delete && state.consumers == 0
            }
            None => false,
        };
        if remove {
            self.queues.remove(queue);
            self.bindings.retain(|binding| binding.queue != queue);
            debug!(queue, "auto-delete queue removed");
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|queue| queue.ready.iter().filter_map(|stored| stored.expires_at))
            .min()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ready (not yet delivered) messages, after applying expiry.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let mut state = self.inner.state.lock().await;
        state.expire(Instant::now());
        state.queues.get(queue).map(|queue| queue.ready.len())
    }

    /// Remove and return every ready message of `queue`, after applying expiry.
    pub async fn take_ready(&self, queue: &str) -> Vec<Message> {
        let mut state = self.inner.state.lock().await;
        state.expire(Instant::now());
        state.queues.get_mut(queue).map_or_else(Vec::new, |queue| {
            queue.ready.drain(..).map(|stored| stored.message).collect()
        })
    }

    pub async fn exchange_count(&self) -> usize {
        self.inner.state.lock().await.exchanges.len()
    }

    pub async fn queue_count(&self) -> usize {
        self.inner.state.lock().await.queues.len()
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.state.lock().await.bindings.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TopologyError> {
        if exchange.name.is_empty() || exchange.name.starts_with("amq.") {
            return Err(TopologyError::Refused {
                name: exchange.name.clone(),
                reason: "exchange name is reserved".to_string(),
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TopologyError::Connection("broker is closed".to_string()));
        }

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                kind: "exchange",
                name: exchange.name.clone(),
            }),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TopologyError> {
        if queue.name.is_empty() || queue.name.starts_with("amq.") {
            return Err(TopologyError::Refused {
                name: queue.name.clone(),
                reason: "queue name is reserved".to_string(),
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TopologyError::Connection("broker is closed".to_string()));
        }

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec == *queue => Ok(()),
            Some(_) => Err(TopologyError::Conflict {
                kind: "queue",
                name: queue.name.clone(),
            }),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), TopologyError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TopologyError::Connection("broker is closed".to_string()));
        }
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(TopologyError::NotFound {
                kind: "exchange",
                name: binding.exchange.clone(),
            });
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(TopologyError::NotFound {
                kind: "queue",
                name: binding.queue.clone(),
            });
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), PublishError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(PublishError::ChannelClosed);
        }
        let now = Instant::now();
        state.expire(now);
        if state.route(exchange, routing_key, message, now)? == 0 {
            // Unroutable messages are dropped, as with mandatory=false.
            debug!(exchange, routing_key, "message was not routed to any queue");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn Subscription>, ConsumeError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ConsumeError::ChannelClosed);
        }
        let notify = state
            .queues
            .get_mut(queue)
            .map(|queue| {
                queue.consumers += 1;
                queue.notify.clone()
            })
            .ok_or_else(|| ConsumeError::QueueNotFound(queue.to_string()))?;

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

// Deliveries are pulled one at a time and each call returns at most one
// message, so every subscription behaves as prefetch = 1.
struct MemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery, ConsumeError>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting the queue so a publish that
            // lands in between still wakes us.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                state.expire(now);
                let tag = state.tag();

                let Some(queue) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(ConsumeError::QueueNotFound(self.queue.clone())));
                };

                if let Some(stored) = queue.ready.pop_front() {
                    let message = stored.message.clone();
                    let redelivered = stored.redelivered;
                    queue.unacked.insert(tag, stored);
                    let acker = MemoryAcker {
                        inner: self.inner.clone(),
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Some(Ok(Delivery::new(message, redelivered, Box::new(acker))));
                }

                state.next_expiry()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let released = match self.inner.state.try_lock() {
            Ok(mut state) => {
                state.release_consumer(&self.queue);
                true
            }
            Err(_) => false,
        };
        if released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            let queue = self.queue.clone();
            handle.spawn(async move {
                inner.state.lock().await.release_consumer(&queue);
            });
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), ConsumeError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ConsumeError::ChannelClosed);
        }
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.unacked.remove(&self.tag);
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), ConsumeError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ConsumeError::ChannelClosed);
        }
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Ok(());
        };
        let Some(mut stored) = queue.unacked.remove(&self.tag) else {
            return Ok(());
        };

        if requeue {
            stored.redelivered = true;
            queue.ready.push_front(stored);
            queue.notify.notify_waiters();
        } else {
            state.dead_letter(&self.queue, stored, DEATH_REJECTED, Instant::now());
        }
        Ok(())
    }
}
