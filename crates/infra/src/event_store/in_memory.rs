use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use eventbus_core::{EventId, MessageId};
use eventbus_events::{EventInput, StoredEvent};

use super::r#trait::{EventFilter, EventStore, EventStoreError, OutboxTransaction, RetentionScope};

/// In-memory outbox table plus a small key/value "business" schema.
///
/// Intended for tests/dev. Business rows are plain JSON documents grouped by
/// table name so that a single [`InMemoryTransaction`] can cover both the
/// business write and the outbox insert, the same way a database transaction
/// would.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<BTreeMap<EventId, StoredEvent>>,
    tables: RwLock<HashMap<String, Vec<JsonValue>>>,
    next_id: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction. Nothing it stages is visible until [`InMemoryTransaction::commit`].
    pub fn begin(&self) -> InMemoryTransaction<'_> {
        InMemoryTransaction {
            store: self,
            events: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut InMemoryTransaction<'_>) -> Result<T, E>,
        E: From<EventStoreError>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Committed rows of a business table.
    pub fn rows(&self, table: &str) -> Result<Vec<JsonValue>, EventStoreError> {
        let tables = self.tables.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(tables.get(table).cloned().unwrap_or_default())
    }

    pub fn row_count(&self, table: &str) -> Result<usize, EventStoreError> {
        let tables = self.tables.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(tables.get(table).map(Vec::len).unwrap_or(0))
    }

    /// Snapshot of every committed outbox row, in id order.
    pub fn events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let events = self.events.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(events.values().cloned().collect())
    }

    /// Insert an already-built row as-is, bypassing id assignment.
    ///
    /// Test support for seeding rows with a chosen `created_at`.
    pub fn insert_raw(&self, event: StoredEvent) -> Result<(), EventStoreError> {
        let mut events = self.events.write().map_err(|_| EventStoreError::Poisoned)?;
        self.next_id.fetch_max(event.id.value(), Ordering::SeqCst);
        events.insert(event.id, event);
        Ok(())
    }

    fn allocate_id(&self) -> EventId {
        EventId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl EventStore for InMemoryEventStore {
    fn select_unpublished_excluding(
        &self,
        limit: usize,
        excluded_topics: &[String],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let events = self.events.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(events
            .values()
            .filter(|e| !e.is_published() && !excluded_topics.contains(&e.topic))
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> Result<bool, EventStoreError> {
        let mut events = self.events.write().map_err(|_| EventStoreError::Poisoned)?;
        match events.get_mut(&id) {
            Some(event) => {
                event.published_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: RetentionScope,
    ) -> Result<u64, EventStoreError> {
        let mut events = self.events.write().map_err(|_| EventStoreError::Poisoned)?;
        let before = events.len();
        events.retain(|_, e| {
            let expired = e.created_at < cutoff;
            let eligible = match scope {
                RetentionScope::All => true,
                RetentionScope::PublishedOnly => e.is_published(),
            };
            !(expired && eligible)
        });
        Ok((before - events.len()) as u64)
    }

    fn count(&self, filter: &EventFilter) -> Result<u64, EventStoreError> {
        let events = self.events.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(events.values().filter(|e| filter.matches(e)).count() as u64)
    }
}

/// Staged writes against an [`InMemoryEventStore`].
///
/// Dropping the transaction without committing discards everything it staged.
#[derive(Debug)]
pub struct InMemoryTransaction<'s> {
    store: &'s InMemoryEventStore,
    events: Vec<StoredEvent>,
    rows: Vec<(String, JsonValue)>,
}

impl InMemoryTransaction<'_> {
    /// Stage a business row.
    pub fn insert_row(&mut self, table: impl Into<String>, row: JsonValue) {
        self.rows.push((table.into(), row));
    }

    pub fn staged_events(&self) -> &[StoredEvent] {
        &self.events
    }

    /// Apply all staged writes atomically. Returns the committed outbox rows.
    pub fn commit(self) -> Result<Vec<StoredEvent>, EventStoreError> {
        // Lock order: events, then tables.
        let mut events = self.store.events.write().map_err(|_| EventStoreError::Poisoned)?;
        let mut tables = self.store.tables.write().map_err(|_| EventStoreError::Poisoned)?;

        for (table, row) in self.rows {
            tables.entry(table).or_default().push(row);
        }
        for event in &self.events {
            events.insert(event.id, event.clone());
        }
        Ok(self.events)
    }

    pub fn rollback(self) {
        tracing::debug!(
            staged_events = self.events.len(),
            staged_rows = self.rows.len(),
            "in-memory transaction rolled back"
        );
    }
}

impl OutboxTransaction for InMemoryTransaction<'_> {
    fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError> {
        event.validate()?;

        let stored = StoredEvent {
            id: self.store.allocate_id(),
            message_id: MessageId::new(),
            topic: event.topic,
            event_type: event.event_type,
            content_type: event.content_type,
            key: event.key,
            payload: event.payload,
            created_at: Utc::now(),
            published_at: None,
        };
        self.events.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn order_created(n: u32) -> EventInput {
        EventInput::new(
            "orders",
            "order.created",
            "application/json",
            format!("{{\"order\":{n}}}").into_bytes(),
        )
    }

    #[test]
    fn uncommitted_events_are_invisible() {
        let store = InMemoryEventStore::new();
        let mut tx = store.begin();
        tx.insert_event(order_created(1)).unwrap();

        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);
        tx.commit().unwrap();
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 1);
    }

    #[test]
    fn dropped_transaction_discards_rows_and_events() {
        let store = InMemoryEventStore::new();
        {
            let mut tx = store.begin();
            tx.insert_row("orders", json!({"id": 1}));
            tx.insert_event(order_created(1)).unwrap();
        }
        assert_eq!(store.row_count("orders").unwrap(), 0);
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);
    }

    #[test]
    fn transaction_helper_rolls_back_on_error() {
        let store = InMemoryEventStore::new();
        let result: Result<(), EventStoreError> = store.transaction(|tx| {
            tx.insert_row("orders", json!({"id": 1}));
            tx.insert_event(order_created(1))?;
            Err(EventStoreError::Database("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.row_count("orders").unwrap(), 0);
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);
    }

    #[test]
    fn ids_are_increasing_and_selection_is_in_id_order() {
        let store = InMemoryEventStore::new();
        store
            .transaction(|tx| {
                for n in 0..5 {
                    tx.insert_event(order_created(n))?;
                }
                Ok::<_, EventStoreError>(())
            })
            .unwrap();

        let pending = store.select_unpublished(3).unwrap();
        let ids: Vec<u64> = pending.iter().map(|e| e.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(pending.iter().all(|e| e.published_at.is_none()));
    }

    #[test]
    fn selection_can_skip_topics() {
        let store = InMemoryEventStore::new();
        store
            .transaction(|tx| {
                tx.insert_event(order_created(1))?;
                tx.insert_event(EventInput::new("payments", "payment.captured", "application/json", b"{}".to_vec()))?;
                tx.insert_event(order_created(2))
            })
            .unwrap();

        let pending = store.select_unpublished_excluding(10, &["orders".to_string()]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "payments");
        assert_eq!(store.select_unpublished_excluding(10, &[]).unwrap().len(), 3);
    }

    #[test]
    fn marking_published_removes_row_from_pending_selection() {
        let store = InMemoryEventStore::new();
        let committed = store
            .transaction(|tx| {
                tx.insert_event(order_created(1))?;
                tx.insert_event(order_created(2))
            })
            .unwrap();

        assert!(store.mark_published(committed.id, Utc::now()).unwrap());
        let pending = store.select_unpublished(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(store.count(&EventFilter::all().published()).unwrap(), 1);
        assert!(!store.mark_published(EventId::new(999), Utc::now()).unwrap());
    }

    #[test]
    fn retention_scope_controls_unpublished_rows() {
        let store = InMemoryEventStore::new();
        let old = Utc::now() - ChronoDuration::hours(2);
        for (id, published) in [(1u64, true), (2, false)] {
            store
                .insert_raw(StoredEvent {
                    id: EventId::new(id),
                    message_id: MessageId::new(),
                    topic: "orders".into(),
                    event_type: "order.created".into(),
                    content_type: "application/json".into(),
                    key: None,
                    payload: vec![],
                    created_at: old,
                    published_at: published.then_some(old),
                })
                .unwrap();
        }
        let cutoff = Utc::now() - ChronoDuration::hours(1);

        assert_eq!(store.delete_older_than(cutoff, RetentionScope::PublishedOnly).unwrap(), 1);
        assert_eq!(store.count(&EventFilter::all().pending()).unwrap(), 1);
        assert_eq!(store.delete_older_than(cutoff, RetentionScope::All).unwrap(), 1);
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 0);
    }

    #[test]
    fn raw_insert_advances_id_allocator() {
        let store = InMemoryEventStore::new();
        store
            .insert_raw(StoredEvent {
                id: EventId::new(40),
                message_id: MessageId::new(),
                topic: "orders".into(),
                event_type: "order.created".into(),
                content_type: "application/json".into(),
                key: None,
                payload: vec![],
                created_at: Utc::now(),
                published_at: None,
            })
            .unwrap();

        let mut tx = store.begin();
        let stored = tx.insert_event(order_created(1)).unwrap();
        assert_eq!(stored.id.value(), 41);
    }

    #[test]
    fn invalid_input_is_rejected_before_staging() {
        let store = InMemoryEventStore::new();
        let mut tx = store.begin();
        let err = tx
            .insert_event(EventInput::new("", "order.created", "application/json", vec![]))
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Constraint(_)));
        assert!(tx.staged_events().is_empty());
    }
}
