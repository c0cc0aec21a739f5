use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventbus_core::{DomainError, DomainResult, EventId, MessageId};

/// Producer-side description of an event, before the store assigns identity.
///
/// `payload` is opaque to the bus; `content_type` tells consumers how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInput {
    pub topic: String,
    pub event_type: String,
    pub content_type: String,

    /// Optional partition key. When absent the topic name is used, so every
    /// event of a topic lands on the same partition and keeps relay order.
    pub key: Option<String>,

    pub payload: Vec<u8>,
}

impl EventInput {
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            content_type: content_type.into(),
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Validate producer input. Event and content types are opaque and may be
    /// empty, as may the payload; a blank topic is not allowed.
    pub fn validate(&self) -> DomainResult<()> {
        if self.topic.trim().is_empty() {
            return Err(DomainError::validation("event topic must not be empty"));
        }
        if matches!(&self.key, Some(k) if k.is_empty()) {
            return Err(DomainError::validation("partition key must not be empty when set"));
        }
        Ok(())
    }
}

/// An event row as persisted in the outbox table.
///
/// `published_at == None` means the relay has not yet delivered the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    pub message_id: MessageId,
    pub topic: String,
    pub event_type: String,
    pub content_type: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    /// Key the relay publishes under.
    pub fn partition_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.topic)
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// An event as handed to consumer handlers, with its broker coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutput {
    pub event_id: EventId,
    pub message_id: MessageId,
    pub topic: String,
    pub event_type: String,
    pub content_type: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,

    pub partition: u32,
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_topic_is_rejected() {
        let input = EventInput::new("  ", "order.created", "application/json", b"{}".to_vec());
        assert!(matches!(input.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn empty_payload_and_types_are_accepted() {
        let input = EventInput::new("orders", "order.created", "application/json", Vec::new());
        assert!(input.validate().is_ok());
        let untyped = EventInput::new("orders", "", "", b"{}".to_vec());
        assert!(untyped.validate().is_ok());
    }

    #[test]
    fn partition_key_defaults_to_topic() {
        let stored = StoredEvent {
            id: EventId::new(1),
            message_id: MessageId::new(),
            topic: "orders".into(),
            event_type: "order.created".into(),
            content_type: "application/json".into(),
            key: None,
            payload: vec![],
            created_at: Utc::now(),
            published_at: None,
        };
        assert_eq!(stored.partition_key(), "orders");

        let keyed = StoredEvent {
            key: Some("customer-7".into()),
            ..stored
        };
        assert_eq!(keyed.partition_key(), "customer-7");
    }
}
