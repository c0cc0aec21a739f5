use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use eventbus_core::{DomainError, EventId};
use eventbus_events::{EventInput, StoredEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, connectivity) as opposed to
/// domain errors (validation).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("database error: {0}")]
    Database(String),

    /// A store constraint rejected the write (unique, check, foreign key).
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("failed to decode event row: {0}")]
    Decode(String),

    /// The blocking adapter could not reach an async runtime.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<DomainError> for EventStoreError {
    fn from(err: DomainError) -> Self {
        Self::Constraint(err.to_string())
    }
}

/// Which rows the retention sweep may delete.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RetentionScope {
    /// Delete every row older than the cutoff, published or not.
    #[default]
    All,
    /// Keep rows the relay has not delivered yet, whatever their age.
    PublishedOnly,
}

impl core::fmt::Display for RetentionScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            RetentionScope::All => "all",
            RetentionScope::PublishedOnly => "published-only",
        })
    }
}

impl core::str::FromStr for RetentionScope {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "all" => Ok(RetentionScope::All),
            "published-only" | "published" => Ok(RetentionScope::PublishedOnly),
            other => Err(DomainError::validation(format!("unknown retention scope '{other}'"))),
        }
    }
}

/// Row filter for [`EventStore::count`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub topic: Option<String>,

    /// `Some(true)` = published rows only, `Some(false)` = pending rows only.
    pub published: Option<bool>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            published: None,
        }
    }

    pub fn pending(mut self) -> Self {
        self.published = Some(false);
        self
    }

    pub fn published(mut self) -> Self {
        self.published = Some(true);
        self
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.topic.as_deref().is_none_or(|t| t == event.topic)
            && self.published.is_none_or(|p| p == event.is_published())
    }
}

/// A caller-owned transaction the outbox writer can enlist in.
///
/// The writer never begins, commits, or rolls back; the row it inserts becomes
/// visible exactly when the caller's transaction commits.
pub trait OutboxTransaction {
    /// Insert one event row. The store assigns `id`, `message_id` and
    /// `created_at`; `published_at` starts empty.
    fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError>;
}

/// Async counterpart of [`OutboxTransaction`] for callers already running on
/// an async runtime (e.g. a `sqlx::Transaction`).
#[async_trait::async_trait]
pub trait AsyncOutboxTransaction: Send {
    async fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError>;
}

/// Outbox table operations used by the relay, cleanup loop, and tooling.
///
/// ## Concurrency
///
/// The writer inserts, the relay selects and marks, and the cleanup loop
/// deletes, all concurrently. Implementations must not serialise these behind
/// a process-level lock; correctness relies on row-level semantics and on the
/// operations being order-independent.
pub trait EventStore: Send + Sync {
    /// Up to `limit` unpublished rows, oldest `id` first.
    fn select_unpublished(&self, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.select_unpublished_excluding(limit, &[])
    }

    /// Like [`select_unpublished`](Self::select_unpublished), skipping rows of
    /// the given topics.
    fn select_unpublished_excluding(
        &self,
        limit: usize,
        excluded_topics: &[String],
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Record a successful publish. Returns `false` when the row no longer
    /// exists (e.g. it was swept by retention in the meantime).
    fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> Result<bool, EventStoreError>;

    /// Delete rows created strictly before `cutoff`. Returns the number deleted.
    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: RetentionScope,
    ) -> Result<u64, EventStoreError>;

    fn count(&self, filter: &EventFilter) -> Result<u64, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn select_unpublished(&self, limit: usize) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).select_unpublished(limit)
    }

    fn select_unpublished_excluding(
        &self,
        limit: usize,
        excluded_topics: &[String],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).select_unpublished_excluding(limit, excluded_topics)
    }

    fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> Result<bool, EventStoreError> {
        (**self).mark_published(id, at)
    }

    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: RetentionScope,
    ) -> Result<u64, EventStoreError> {
        (**self).delete_older_than(cutoff, scope)
    }

    fn count(&self, filter: &EventFilter) -> Result<u64, EventStoreError> {
        (**self).count(filter)
    }
}
