//! JSON message envelope
//!
//! Every wire message travels inside an envelope carrying identity,
//! correlation, and free-form headers. A response's `correlation_id` always
//! equals the request's `message_id`.

use crate::protocol::{ErrorCode, InvalidMessage, Message};
use crate::resilience::epoch_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Wire protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header carrying the message id a validation failure refers to.
pub const HEADER_ORIGINAL_MESSAGE_ID: &str = "originalMessageId";
/// Header carrying the attempt count after retry exhaustion.
pub const HEADER_ATTEMPTS: &str = "attempts";
/// Header carrying the final backoff applied before giving up.
pub const HEADER_LAST_BACKOFF_MS: &str = "lastBackoffMs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub timestamp_millis: u64,
    pub version: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: impl Into<String>, receiver_id: impl Into<String>, message: Message) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            timestamp_millis: epoch_millis(),
            version: PROTOCOL_VERSION.to_string(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            correlation_id: None,
            headers: HashMap::new(),
            message,
        }
    }

    /// A response to `request`, correlated by the request's message id and
    /// addressed back to its sender.
    pub fn respond_to(request: &Envelope, sender_id: impl Into<String>, message: Message) -> Self {
        let mut envelope = Self::new(sender_id, request.sender_id.clone(), message);
        envelope.correlation_id = Some(request.message_id.clone());
        envelope
    }

    /// An error response to `request`, carrying the `originalMessageId` header.
    pub fn error_for(
        request: &Envelope,
        sender_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::respond_to(
            request,
            sender_id,
            Message::Error { code, message: message.into() },
        );
        envelope
            .headers
            .insert(HEADER_ORIGINAL_MESSAGE_ID.to_string(), request.message_id.clone());
        envelope
    }

    /// A correlated error when only the offending message id is known.
    pub fn error_raw(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        original_message_id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let mut envelope =
            Self::new(sender_id, receiver_id, Message::Error { code, message: message.into() });
        if let Some(id) = original_message_id {
            envelope.correlation_id = Some(id.clone());
            envelope.headers.insert(HEADER_ORIGINAL_MESSAGE_ID.to_string(), id);
        }
        envelope
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Envelope plus payload validation.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        if self.message_id.trim().is_empty() {
            return Err(InvalidMessage { reason: "message_id must not be empty".to_string() });
        }
        if self.sender_id.trim().is_empty() {
            return Err(InvalidMessage { reason: "sender_id must not be empty".to_string() });
        }
        self.message.validate()
    }
}
