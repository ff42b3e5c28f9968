//! Correlated request/response over a private reply queue.
//!
//! Each client declares its own exclusive, auto-delete reply queue and names
//! it in `reply-to`, so replies never reach another instance's listener. One
//! listener task drains that queue for every caller of the client. Each `call`
//! registers a one-shot waiter under a fresh correlation id *before*
//! publishing, so a reply that beats the caller back still finds its waiter.
//! Replies are matched only by correlation id; unknown or late ones are
//! acknowledged and dropped.

use super::{
    envelope::{CorrelationId, ReplyEnvelope, RequestEnvelope},
    Broker, CallError, ConsumeError, DecodeError, PublishError, QueueSpec,
};
use serde::Serialize;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

#[derive(Default)]
struct Waiters {
    senders: HashMap<CorrelationId, oneshot::Sender<ReplyEnvelope>>,
    closed: bool,
}

/// Waiters keyed by correlation id. Critical sections are map operations only.
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<Waiters>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, Waiters> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    /// - [`CallError::DuplicateCorrelationId`] if `id` is already waiting.
    /// - [`CallError::ListenerClosed`] once [`PendingReplies::close`] ran.
    pub fn register(
        &self,
        id: CorrelationId,
    ) -> Result<oneshot::Receiver<ReplyEnvelope>, CallError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        if waiters.closed {
            return Err(CallError::ListenerClosed);
        }
        match waiters.senders.entry(id) {
            Entry::Occupied(entry) => Err(CallError::DuplicateCorrelationId(
                entry.key().to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Hand `reply` to its waiter. Returns `false` when no waiter is registered
    /// (unknown, timed out or already resolved); that is not an error.
    pub fn resolve(&self, reply: ReplyEnvelope) -> bool {
        let waiter = self.lock().senders.remove(&reply.correlation_id);
        match waiter {
            // The receiver may have been dropped between removal and send.
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, id: &CorrelationId) {
        self.lock().senders.remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().senders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().senders.is_empty()
    }

    /// Drop every waiter and refuse new ones; callers observe
    /// [`CallError::ListenerClosed`].
    pub fn close(&self) {
        let drained = {
            let mut waiters = self.lock();
            waiters.closed = true;
            std::mem::take(&mut waiters.senders)
        };
        if !drained.is_empty() {
            warn!(
                outstanding = drained.len(),
                "reply listener stopped with outstanding calls"
            );
        }
    }
}

/// Removes the waiter when the call finishes for any reason, including the
/// caller's future being dropped.
struct Waiter<'a> {
    pending: &'a PendingReplies,
    id: CorrelationId,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

/// `<instance ULID>-<sequence>`: the counter makes ids unique within the
/// process, the ULID prefix across processes.
pub struct CorrelationIds {
    prefix: Ulid,
    sequence: AtomicU64,
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self {
            prefix: Ulid::new(),
            sequence: AtomicU64::new(0),
        }
    }
}

impl CorrelationIds {
    pub fn next_id(&self) -> CorrelationId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        CorrelationId::new(format!("{}-{sequence}", self.prefix))
    }

    /// The per-instance part shared by every id.
    #[must_use]
    pub const fn instance(&self) -> Ulid {
        self.prefix
    }
}

#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Exchange and routing key requests are published to.
    pub exchange: String,
    pub routing_key: String,
    /// Base name of the reply queue. The client consumes from
    /// `<reply_queue>.<instance>` and sends that name as `reply-to`.
    pub reply_queue: String,
}

pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: RpcConfig,
    reply_queue: String,
    pending: Arc<PendingReplies>,
    ids: CorrelationIds,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Declare this client's reply queue, subscribe to it and start the
    /// listener.
    ///
    /// # Errors
    /// Returns [`ConsumeError`] if the reply queue cannot be declared or
    /// consumed.
    pub async fn start(broker: Arc<dyn Broker>, config: RpcConfig) -> Result<Self, ConsumeError> {
        let ids = CorrelationIds::default();
        let reply_queue = format!("{}.{}", config.reply_queue, ids.instance());

        broker
            .declare_queue(&QueueSpec::exclusive(&reply_queue))
            .await?;
        let subscription = broker.subscribe(&reply_queue, 0).await?;
        let pending = Arc::new(PendingReplies::default());
        let listener = tokio::spawn(listen(subscription, pending.clone()));

        info!(%reply_queue, "reply listener started");

        Ok(Self {
            broker,
            config,
            reply_queue,
            pending,
            ids,
            listener,
        })
    }

    /// Publish `payload` and wait up to `timeout` for the matching reply.
    ///
    /// # Errors
    /// - [`CallError::Timeout`]: no reply in time. The outcome is unknown.
    /// - [`CallError::Publish`]: the request never reached the broker.
    /// - [`CallError::ListenerClosed`]: the reply listener stopped.
    #[instrument(skip(self, payload), fields(correlation_id = tracing::field::Empty))]
    pub async fn call<T: Serialize + Sync>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> Result<ReplyEnvelope, CallError> {
        let id = self.ids.next_id();
        tracing::Span::current().record("correlation_id", id.as_str());

        let request = RequestEnvelope::new(
            id.clone(),
            payload,
            Some(self.reply_queue.clone()),
        )
        .map_err(|err| match err {
            DecodeError::Body(err) => PublishError::Serialize(err),
            other => PublishError::Rejected(other.to_string()),
        })?;

        let rx = self.pending.register(id.clone())?;
        let _waiter = Waiter {
            pending: &self.pending,
            id,
        };

        self.broker
            .publish(
                &self.config.exchange,
                &self.config.routing_key,
                request.into_message(),
            )
            .await?;
        debug!("request published");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::ListenerClosed),
            Err(_) => {
                warn!(?timeout, "no reply before timeout");
                Err(CallError::Timeout(timeout))
            }
        }
    }

    /// The private queue named in every request's `reply-to`.
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls currently waiting for a reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut subscription: Box<dyn super::Subscription>, pending: Arc<PendingReplies>) {
    while let Some(next) = subscription.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(err) => {
                error!("reply subscription failed: {err}");
                break;
            }
        };

        let settled = match ReplyEnvelope::from_message(&delivery.message) {
            Ok(reply) => {
                let id = reply.correlation_id.clone();
                if pending.resolve(reply) {
                    debug!(correlation_id = %id, "reply delivered");
                } else {
                    debug!(correlation_id = %id, "discarding reply with no waiter");
                }
                delivery.ack().await
            }
            Err(err) => {
                warn!("discarding malformed reply: {err}");
                delivery.reject(false).await
            }
        };

        if let Err(err) = settled {
            error!("failed to settle reply: {err}");
        }
    }

    pending.close();
    info!("reply listener stopped");
}
