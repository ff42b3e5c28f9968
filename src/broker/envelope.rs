//! Request and reply envelopes exchanged over the broker.
//!
//! The correlation id travels in the AMQP `correlation-id` property, never in
//! the body, so any JSON payload can be carried unchanged.

use super::{DecodeError, Message, CONTENT_TYPE_JSON};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Opaque token joining a request to its reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn correlation_id(message: &Message) -> Result<CorrelationId, DecodeError> {
    match message.properties.correlation_id.as_deref() {
        Some(id) if !id.trim().is_empty() => Ok(CorrelationId::new(id)),
        _ => Err(DecodeError::MissingCorrelationId),
    }
}

// An absent content type is tolerated; older producers never set it.
fn check_content_type(message: &Message) -> Result<(), DecodeError> {
    match message.properties.content_type.as_deref() {
        None => Ok(()),
        Some(content_type) if content_type.starts_with(CONTENT_TYPE_JSON) => Ok(()),
        Some(other) => Err(DecodeError::ContentType(other.to_string())),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    /// Queue the reply should be sent to, if the caller named one.
    pub reply_to: Option<String>,
}

impl RequestEnvelope {
    /// # Errors
    /// Returns [`DecodeError::Body`] if the payload cannot be serialized.
    pub fn new<T: Serialize>(
        correlation_id: CorrelationId,
        payload: &T,
        reply_to: Option<String>,
    ) -> Result<Self, DecodeError> {
        Ok(Self {
            correlation_id,
            payload: serde_json::to_vec(payload)?,
            reply_to,
        })
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        let message = Message::json(self.payload).with_correlation_id(self.correlation_id.0);
        match self.reply_to {
            Some(reply_to) => message.with_reply_to(reply_to),
            None => message,
        }
    }

    /// # Errors
    /// Returns [`DecodeError`] if the correlation id is missing or the content
    /// type is not JSON.
    pub fn from_message(message: &Message) -> Result<Self, DecodeError> {
        let correlation_id = correlation_id(message)?;
        check_content_type(message)?;
        Ok(Self {
            correlation_id,
            payload: message.body.clone(),
            reply_to: message
                .properties
                .reply_to
                .clone()
                .filter(|reply_to| !reply_to.is_empty()),
        })
    }

    /// # Errors
    /// Returns [`DecodeError::Body`] if the payload is not valid JSON for `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    status: ReplyStatus,
    message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub status: ReplyStatus,
    pub message: String,
}

impl ReplyEnvelope {
    #[must_use]
    pub fn success(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Success,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, ReplyStatus::Success)
    }

    /// # Errors
    /// Returns [`DecodeError::Body`] if the body cannot be serialized.
    pub fn into_message(self) -> Result<Message, DecodeError> {
        let body = serde_json::to_vec(&ReplyBody {
            status: self.status,
            message: self.message,
        })?;
        Ok(Message::json(body).with_correlation_id(self.correlation_id.0))
    }

    /// # Errors
    /// Returns [`DecodeError`] if the correlation id is missing or the body is
    /// not a `{status, message}` object.
    pub fn from_message(message: &Message) -> Result<Self, DecodeError> {
        let correlation_id = correlation_id(message)?;
        check_content_type(message)?;
        let body: ReplyBody = serde_json::from_slice(&message.body)?;
        Ok(Self {
            correlation_id,
            status: body.status,
            message: body.message,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_carries_correlation_id_and_reply_to() {
        let request = RequestEnvelope::new(
            CorrelationId::new("01J-1"),
            &json!({"email": "a@x.com", "password": "p1"}),
            Some("login_response".to_string()),
        )
        .unwrap();

        let message = request.clone().into_message();
        assert_eq!(message.properties.correlation_id.as_deref(), Some("01J-1"));
        assert_eq!(message.properties.reply_to.as_deref(), Some("login_response"));
        assert_eq!(
            message.properties.content_type.as_deref(),
            Some(CONTENT_TYPE_JSON)
        );

        let decoded = RequestEnvelope::from_message(&message).unwrap();
        assert_eq!(decoded, request);
        let payload: serde_json::Value = decoded.decode_payload().unwrap();
        assert_eq!(payload["email"], "a@x.com");
    }

    #[test]
    fn request_without_correlation_id_is_rejected() {
        let message = Message::json(b"{}".to_vec());
        assert!(matches!(
            RequestEnvelope::from_message(&message),
            Err(DecodeError::MissingCorrelationId)
        ));

        let message = Message::json(b"{}".to_vec()).with_correlation_id("  ");
        assert!(matches!(
            RequestEnvelope::from_message(&message),
            Err(DecodeError::MissingCorrelationId)
        ));
    }

    #[test]
    fn request_with_foreign_content_type_is_rejected() {
        let mut message = Message::json(b"<xml/>".to_vec()).with_correlation_id("c");
        message.properties.content_type = Some("application/xml".to_string());
        assert!(matches!(
            RequestEnvelope::from_message(&message),
            Err(DecodeError::ContentType(ct)) if ct == "application/xml"
        ));

        message.properties.content_type = None;
        message.body = b"{}".to_vec();
        assert!(RequestEnvelope::from_message(&message).is_ok());
    }

    #[test]
    fn reply_wire_format() {
        let reply = ReplyEnvelope::error(CorrelationId::new("c-7"), "Invalid credentials");
        let message = reply.into_message().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(
            body,
            json!({"status": "error", "message": "Invalid credentials"})
        );
        assert_eq!(message.properties.correlation_id.as_deref(), Some("c-7"));
    }

    #[test]
    fn reply_with_garbage_body_is_rejected() {
        let message = Message::json(b"not json".to_vec()).with_correlation_id("c");
        assert!(matches!(
            ReplyEnvelope::from_message(&message),
            Err(DecodeError::Body(_))
        ));

        let message = Message::json(br#"{"status":"maybe","message":""}"#.to_vec())
            .with_correlation_id("c");
        assert!(ReplyEnvelope::from_message(&message).is_err());
    }

    #[test]
    fn reply_status_helpers() {
        let reply = ReplyEnvelope::success(CorrelationId::new("c"), "Login successful");
        assert!(reply.is_success());
        assert!(!ReplyEnvelope::error(CorrelationId::new("c"), "nope").is_success());
    }
}
