//! Verification consumer: answers login requests from the verification queue.
//!
//! One delivery is handled at a time (prefetch 1). Every well-formed request
//! gets exactly one reply carrying its correlation id; malformed requests are
//! rejected without requeue so they end up in the dead-letter queue instead of
//! blocking the queue.

pub mod credentials;

pub use self::credentials::{verify, LoginRequest, Outcome};

use crate::{
    broker::{
        envelope::{ReplyEnvelope, RequestEnvelope},
        Broker, ConsumeError, Delivery, PublishError,
    },
    store::CredentialStore,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub queue: String,
    /// Route used when a request carries no `reply-to`.
    pub reply_exchange: String,
    pub reply_routing_key: String,
    pub prefetch: u16,
}

#[derive(Clone)]
pub struct VerificationConsumer {
    broker: Arc<dyn Broker>,
    credentials: Arc<dyn CredentialStore>,
    config: VerifierConfig,
}

impl VerificationConsumer {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        credentials: Arc<dyn CredentialStore>,
        config: VerifierConfig,
    ) -> Self {
        Self {
            broker,
            credentials,
            config,
        }
    }

    /// Consume until `shutdown` flips to `true` or the subscription ends.
    ///
    /// # Errors
    /// Returns [`ConsumeError`] only if the queue cannot be subscribed to.
    /// Per-message failures are logged and never end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumeError> {
        let mut subscription = self
            .broker
            .subscribe(&self.config.queue, self.config.prefetch.max(1))
            .await?;
        info!(queue = %self.config.queue, "verification consumer started");

        loop {
            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery).await,
                Some(Err(err)) => {
                    error!("verification subscription failed: {err}");
                    break;
                }
                None => break,
            }
        }

        info!(queue = %self.config.queue, "verification consumer stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(correlation_id = tracing::field::Empty))]
    async fn handle(&self, delivery: Delivery) {
        let request = match RequestEnvelope::from_message(&delivery.message) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping malformed request: {err}");
                settle(delivery.reject(false).await);
                return;
            }
        };
        tracing::Span::current().record("correlation_id", request.correlation_id.as_str());

        let login: LoginRequest = match request.decode_payload() {
            Ok(login) => login,
            Err(err) => {
                warn!("dropping undecodable login request: {err}");
                settle(delivery.reject(false).await);
                return;
            }
        };

        let outcome = verify(self.credentials.as_ref(), &login).await;
        debug!(?outcome, "credentials checked");

        let reply = if outcome.is_success() {
            ReplyEnvelope::success(request.correlation_id.clone(), outcome.message())
        } else {
            ReplyEnvelope::error(request.correlation_id.clone(), outcome.message())
        };

        match self.reply(request.reply_to.as_deref(), reply).await {
            Ok(()) => settle(delivery.ack().await),
            Err(err) => {
                // The caller times out; requeueing would only replay the same
                // failure while the channel is down.
                error!("failed to publish reply: {err}");
                settle(delivery.reject(false).await);
            }
        }
    }

    async fn reply(
        &self,
        reply_to: Option<&str>,
        reply: ReplyEnvelope,
    ) -> Result<(), PublishError> {
        let message = reply
            .into_message()
            .map_err(|err| PublishError::Rejected(err.to_string()))?;
        match reply_to {
            // default exchange: routing key is the queue name
            Some(queue) => self.broker.publish("", queue, message).await,
            None => {
                self.broker
                    .publish(
                        &self.config.reply_exchange,
                        &self.config.reply_routing_key,
                        message,
                    )
                    .await
            }
        }
    }
}

fn settle(result: Result<(), ConsumeError>) {
    if let Err(err) = result {
        error!("failed to settle delivery: {err}");
    }
}
