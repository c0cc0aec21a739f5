//! Retention sweep over the outbox table.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Tick, WorkerHandle, wait_tick};
use crate::event_store::{EventStore, EventStoreError, RetentionScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// Rows whose `created_at` is older than `now - retention` are deleted.
    pub retention: Duration,
    pub scope: RetentionScope,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            scope: RetentionScope::All,
        }
    }
}

impl CleanupConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_scope(mut self, scope: RetentionScope) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupStats {
    pub sweeps: u64,
    pub deleted: u64,
    pub failures: u64,
    pub last_cutoff: Option<DateTime<Utc>>,
}

pub struct CleanupLoop<S> {
    store: S,
    config: CleanupConfig,
    stats: Arc<Mutex<CleanupStats>>,
}

impl<S> CleanupLoop<S>
where
    S: EventStore + 'static,
{
    pub fn new(store: S, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            stats: Arc::new(Mutex::new(CleanupStats::default())),
        }
    }

    pub fn stats(&self) -> CleanupStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<CleanupStats>> {
        self.stats.clone()
    }

    /// `now - retention`, or `None` when that predates the representable range.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retention = chrono::Duration::from_std(self.config.retention).ok()?;
        now.checked_sub_signed(retention)
    }

    /// Run one sweep as of `now`. Returns the number of rows deleted.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<u64, EventStoreError> {
        let Some(cutoff) = self.cutoff(now) else {
            return Ok(0);
        };
        let result = self.store.delete_older_than(cutoff, self.config.scope);

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.sweeps += 1;
        stats.last_cutoff = Some(cutoff);
        match &result {
            Ok(deleted) => stats.deleted += deleted,
            Err(_) => stats.failures += 1,
        }
        result
    }

    /// Spawn the sweep loop. The first sweep runs one interval after start.
    pub fn spawn(self, name: impl Into<String>) -> std::io::Result<WorkerHandle> {
        WorkerHandle::spawn(name, move |shutdown_rx| {
            info!(
                interval_secs = self.config.interval.as_secs_f64(),
                retention_secs = self.config.retention.as_secs(),
                scope = %self.config.scope,
                "outbox cleanup started"
            );
            while wait_tick(&shutdown_rx, self.config.interval) == Tick::Run {
                match self.run_once(Utc::now()) {
                    Ok(0) => debug!("outbox cleanup found nothing to delete"),
                    Ok(deleted) => info!(deleted, "outbox cleanup deleted expired events"),
                    Err(err) => warn!(error = %err, "outbox cleanup failed; retrying next interval"),
                }
            }
            info!("outbox cleanup stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use eventbus_core::{EventId, MessageId};
    use eventbus_events::StoredEvent;

    use crate::event_store::{EventFilter, InMemoryEventStore};

    fn row(id: u64, created_at: DateTime<Utc>, published: bool) -> StoredEvent {
        StoredEvent {
            id: EventId::new(id),
            message_id: MessageId::new(),
            topic: "orders".into(),
            event_type: "order.created".into(),
            content_type: "application/json".into(),
            key: None,
            payload: b"{}".to_vec(),
            created_at,
            published_at: published.then_some(created_at),
        }
    }

    #[test]
    fn deletes_only_rows_older_than_retention() {
        let store = Arc::new(InMemoryEventStore::new());
        let now = Utc::now();
        store.insert_raw(row(1, now - ChronoDuration::seconds(10), true)).unwrap();
        store.insert_raw(row(2, now - ChronoDuration::seconds(2), true)).unwrap();

        let cleanup = CleanupLoop::new(
            store.clone(),
            CleanupConfig::default().with_retention(Duration::from_secs(5)),
        );
        assert_eq!(cleanup.run_once(now).unwrap(), 1);
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 1);
        assert_eq!(cleanup.stats().deleted, 1);
    }

    #[test]
    fn published_only_scope_keeps_pending_rows() {
        let store = Arc::new(InMemoryEventStore::new());
        let now = Utc::now();
        store.insert_raw(row(1, now - ChronoDuration::hours(1), false)).unwrap();

        let cleanup = CleanupLoop::new(
            store.clone(),
            CleanupConfig::default()
                .with_retention(Duration::from_secs(1))
                .with_scope(RetentionScope::PublishedOnly),
        );
        assert_eq!(cleanup.run_once(now).unwrap(), 0);
        assert_eq!(store.count(&EventFilter::all().pending()).unwrap(), 1);
    }

    #[test]
    fn huge_retention_never_deletes() {
        let store = Arc::new(InMemoryEventStore::new());
        store.insert_raw(row(1, Utc::now() - ChronoDuration::days(365), true)).unwrap();

        let cleanup = CleanupLoop::new(
            store.clone(),
            CleanupConfig::default().with_retention(Duration::from_secs(u64::MAX)),
        );
        assert_eq!(cleanup.run_once(Utc::now()).unwrap(), 0);
        assert_eq!(store.count(&EventFilter::all()).unwrap(), 1);
    }
}
