//! Outbox writer: the producer-side entry point of the bus.
//!
//! Sending an event never talks to the broker. It inserts one row through the
//! caller's open transaction, so the event is durable exactly when (and only
//! if) the business write it belongs to commits. The relay picks it up later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

use eventbus_core::DomainError;
use eventbus_events::{EventInput, StoredEvent};

use crate::event_store::{AsyncOutboxTransaction, EventStoreError, OutboxTransaction};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("event bus is shut down")]
    Closed,
}

/// Inserts events into the outbox inside caller-owned transactions.
///
/// Cheap to clone. Writers handed out by a provider stop accepting events once
/// the provider shuts down.
#[derive(Debug, Clone)]
pub struct OutboxWriter {
    open: Arc<AtomicBool>,
}

impl Default for OutboxWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxWriter {
    /// A standalone writer that is always open.
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn gated(open: Arc<AtomicBool>) -> Self {
        Self { open }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn admit(&self, input: &EventInput) -> Result<(), OutboxError> {
        if !self.is_open() {
            return Err(OutboxError::Closed);
        }
        input.validate()?;
        Ok(())
    }

    /// Insert `input` as an unpublished outbox row within `tx`.
    ///
    /// Does not commit. If the caller rolls back, the event is never published.
    pub fn send<T>(&self, tx: &mut T, input: EventInput) -> Result<StoredEvent, OutboxError>
    where
        T: OutboxTransaction + ?Sized,
    {
        self.admit(&input)?;
        let stored = tx.insert_event(input)?;
        debug!(
            event_id = %stored.id,
            message_id = %stored.message_id,
            topic = %stored.topic,
            event_type = %stored.event_type,
            "event written to outbox"
        );
        Ok(stored)
    }

    /// Async variant of [`send`](Self::send) for transactions driven on a runtime.
    pub async fn send_async<T>(
        &self,
        tx: &mut T,
        input: EventInput,
    ) -> Result<StoredEvent, OutboxError>
    where
        T: AsyncOutboxTransaction + ?Sized,
    {
        self.admit(&input)?;
        let stored = tx.insert_event(input).await?;
        debug!(
            event_id = %stored.id,
            topic = %stored.topic,
            "event written to outbox"
        );
        Ok(stored)
    }

    /// A writer bound to one topic.
    pub fn for_topic(&self, topic: impl Into<String>) -> Result<TopicWriter, OutboxError> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(DomainError::validation("event topic must not be empty").into());
        }
        Ok(TopicWriter {
            topic,
            writer: self.clone(),
        })
    }
}

/// An [`OutboxWriter`] pinned to a single topic.
#[derive(Debug, Clone)]
pub struct TopicWriter {
    topic: String,
    writer: OutboxWriter,
}

impl TopicWriter {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Build an [`EventInput`] for this topic.
    pub fn event(
        &self,
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> EventInput {
        EventInput::new(self.topic.clone(), event_type, content_type, payload)
    }

    pub fn send<T>(
        &self,
        tx: &mut T,
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<StoredEvent, OutboxError>
    where
        T: OutboxTransaction + ?Sized,
    {
        let input = self.event(event_type, content_type, payload);
        self.writer.send(tx, input)
    }

    /// Send with an explicit partition key.
    pub fn send_keyed<T>(
        &self,
        tx: &mut T,
        key: impl Into<String>,
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<StoredEvent, OutboxError>
    where
        T: OutboxTransaction + ?Sized,
    {
        let input = self.event(event_type, content_type, payload).with_key(key);
        self.writer.send(tx, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventFilter, EventStore, InMemoryEventStore};

    #[test]
    fn send_is_invisible_until_commit() {
        let store = InMemoryEventStore::new();
        let writer = OutboxWriter::new();

        let mut tx = store.begin();
        let stored = writer
            .send(
                &mut tx,
                EventInput::new("orders", "order.created", "application/json", b"{}".to_vec()),
            )
            .unwrap();
        assert!(stored.published_at.is_none());
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);

        tx.commit().unwrap();
        assert_eq!(store.count(&EventFilter::topic("orders").pending()).unwrap(), 1);
    }

    #[test]
    fn rollback_discards_event() {
        let store = InMemoryEventStore::new();
        let writer = OutboxWriter::new();

        let mut tx = store.begin();
        writer
            .send(
                &mut tx,
                EventInput::new("orders", "order.created", "application/json", vec![]),
            )
            .unwrap();
        tx.rollback();

        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);
    }

    #[test]
    fn closed_writer_rejects_events() {
        let open = Arc::new(AtomicBool::new(true));
        let writer = OutboxWriter::gated(open.clone());
        open.store(false, Ordering::SeqCst);

        let store = InMemoryEventStore::new();
        let mut tx = store.begin();
        let err = writer
            .send(&mut tx, EventInput::new("orders", "x", "text/plain", vec![]))
            .unwrap_err();
        assert!(matches!(err, OutboxError::Closed));
        assert!(tx.staged_events().is_empty());
    }

    #[test]
    fn blank_topic_is_rejected() {
        let writer = OutboxWriter::new();
        assert!(matches!(writer.for_topic("  "), Err(OutboxError::Invalid(_))));

        let store = InMemoryEventStore::new();
        let mut tx = store.begin();
        let err = writer
            .send(&mut tx, EventInput::new("", "x", "text/plain", vec![]))
            .unwrap_err();
        assert!(matches!(err, OutboxError::Invalid(_)));
    }

    #[test]
    fn topic_writer_fills_topic_and_key() {
        let store = InMemoryEventStore::new();
        let orders = OutboxWriter::new().for_topic("orders").unwrap();

        let mut tx = store.begin();
        let plain = orders.send(&mut tx, "order.created", "application/json", b"{}".to_vec()).unwrap();
        let keyed = orders
            .send_keyed(&mut tx, "customer-9", "order.paid", "application/json", b"{}".to_vec())
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(plain.topic, "orders");
        assert_eq!(plain.partition_key(), "orders");
        assert_eq!(keyed.partition_key(), "customer-9");
    }
}
