use std::time::Duration;
use thiserror::Error;

/// Declaration failures. Fatal at startup: the process must not serve traffic
/// with a partially declared topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("broker unreachable: {0}")]
    Connection(String),
    #[error("{kind} '{name}' already exists with different arguments")]
    Conflict { kind: &'static str, name: String },
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("broker refused declaration of '{name}': {reason}")]
    Refused { name: String, reason: String },
}

/// Publish failures. Recoverable: the caller decides whether to retry or drop.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("channel is not open")]
    ChannelClosed,
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("channel is not open")]
    ChannelClosed,
    #[error("queue '{0}' not found")]
    QueueNotFound(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error(transparent)]
    Declare(#[from] TopologyError),
}

/// A message that cannot be turned into an envelope. The message is dropped
/// (dead-lettered); the loop that received it keeps running.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing correlation-id")]
    MissingCorrelationId,
    #[error("unsupported content-type '{0}'")]
    ContentType(String),
    #[error("invalid body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Failures of a correlated call.
#[derive(Debug, Error)]
pub enum CallError {
    /// No reply arrived before the deadline. The outcome is unknown, which is
    /// not the same thing as a denial.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("reply listener is not running")]
    ListenerClosed,
    #[error("correlation id '{0}' is already outstanding")]
    DuplicateCorrelationId(String),
}

impl CallError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = TopologyError::Conflict {
            kind: "queue",
            name: "user.registration".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "queue 'user.registration' already exists with different arguments"
        );

        let err = CallError::Timeout(Duration::from_secs(2));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "no reply within 2s");

        let err = CallError::from(PublishError::ChannelClosed);
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "channel is not open");
    }
}
