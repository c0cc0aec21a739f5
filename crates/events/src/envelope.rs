//! Mapping between outbox rows and broker records.
//!
//! Event metadata travels in record headers; the record payload is the raw
//! event payload, untouched.

use chrono::{DateTime, Utc};
use thiserror::Error;

use eventbus_core::{EventId, MessageId};

use crate::broker::{Headers, Message, ProducerRecord};
use crate::event::{EventOutput, StoredEvent};

pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const MESSAGE_ID: &str = "message-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CREATED_AT: &str = "created-at";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing header '{0}'")]
    MissingHeader(&'static str),

    #[error("invalid header '{header}': {reason}")]
    InvalidHeader { header: &'static str, reason: String },
}

/// Build the broker record the relay publishes for a stored event.
pub fn to_record(event: &StoredEvent) -> ProducerRecord {
    let mut headers = Headers::new();
    headers.insert(headers::EVENT_ID.to_string(), event.id.to_string());
    headers.insert(headers::MESSAGE_ID.to_string(), event.message_id.to_string());
    headers.insert(headers::EVENT_TYPE.to_string(), event.event_type.clone());
    headers.insert(headers::CONTENT_TYPE.to_string(), event.content_type.clone());
    headers.insert(headers::CREATED_AT.to_string(), event.created_at.to_rfc3339());

    ProducerRecord {
        topic: event.topic.clone(),
        key: event.partition_key().to_string(),
        headers,
        payload: event.payload.clone(),
    }
}

/// Rebuild the consumer-facing event from a delivered record.
pub fn from_message(message: &Message) -> Result<EventOutput, DecodeError> {
    let event_id: EventId = header(message, headers::EVENT_ID)?
        .parse()
        .map_err(|e: eventbus_core::DomainError| invalid(headers::EVENT_ID, e))?;
    let message_id: MessageId = header(message, headers::MESSAGE_ID)?
        .parse()
        .map_err(|e: eventbus_core::DomainError| invalid(headers::MESSAGE_ID, e))?;
    let created_at = DateTime::parse_from_rfc3339(header(message, headers::CREATED_AT)?)
        .map_err(|e| invalid(headers::CREATED_AT, e))?
        .with_timezone(&Utc);

    Ok(EventOutput {
        event_id,
        message_id,
        topic: message.topic.clone(),
        event_type: header(message, headers::EVENT_TYPE)?.to_string(),
        content_type: header(message, headers::CONTENT_TYPE)?.to_string(),
        key: message.key.clone(),
        payload: message.payload.clone(),
        created_at,
        partition: message.partition,
        offset: message.offset,
    })
}

fn header<'a>(message: &'a Message, name: &'static str) -> Result<&'a str, DecodeError> {
    message
        .headers
        .get(name)
        .map(String::as_str)
        .ok_or(DecodeError::MissingHeader(name))
}

fn invalid(header: &'static str, reason: impl core::fmt::Display) -> DecodeError {
    DecodeError::InvalidHeader {
        header,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> StoredEvent {
        StoredEvent {
            id: EventId::new(7),
            message_id: MessageId::new(),
            topic: "orders".into(),
            event_type: "order.created".into(),
            content_type: "application/json".into(),
            key: None,
            payload: br#"{"id":1}"#.to_vec(),
            created_at: Utc::now(),
            published_at: None,
        }
    }

    fn deliver(record: ProducerRecord) -> Message {
        Message {
            topic: record.topic,
            partition: 0,
            offset: 3,
            id: "0-3".into(),
            key: record.key,
            headers: record.headers,
            payload: record.payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn relayed_record_decodes_to_the_same_event() {
        let event = stored();
        let output = from_message(&deliver(to_record(&event))).unwrap();

        assert_eq!(output.event_id, event.id);
        assert_eq!(output.message_id, event.message_id);
        assert_eq!(output.event_type, "order.created");
        assert_eq!(output.key, "orders");
        assert_eq!(output.payload, event.payload);
        assert_eq!(output.offset, 3);
    }

    #[test]
    fn missing_metadata_is_reported() {
        let mut message = deliver(to_record(&stored()));
        message.headers.remove(headers::MESSAGE_ID);
        assert_eq!(
            from_message(&message),
            Err(DecodeError::MissingHeader(headers::MESSAGE_ID))
        );
    }

    #[test]
    fn malformed_timestamp_is_reported() {
        let mut message = deliver(to_record(&stored()));
        message
            .headers
            .insert(headers::CREATED_AT.to_string(), "yesterday".to_string());
        assert!(matches!(
            from_message(&message),
            Err(DecodeError::InvalidHeader { header: headers::CREATED_AT, .. })
        ));
    }
}
