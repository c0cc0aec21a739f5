//! Postgres-backed outbox table.
//!
//! The table lives next to the application's own tables, so a business write
//! and its outbox row share one database transaction. See
//! `migrations/0001_outbox_events.sql` for the schema.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique / foreign key / check violation) | `23505` / `23503` / `23514` | `Constraint` |
//! | Database (other) | any other | `Database` |
//! | ColumnDecode / Decode | N/A | `Decode` |
//! | PoolClosed, Io, other | N/A | `Database` |
//!
//! ## Sync vs async
//!
//! [`EventStore`] and [`OutboxTransaction`] are blocking traits used by the
//! relay and cleanup threads. They drive the async queries with
//! `Handle::block_on`, so they must be called from threads that are **not**
//! themselves executing inside the runtime. Code already running on the
//! runtime should use the `*_async` methods and [`AsyncOutboxTransaction`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use eventbus_core::{EventId, MessageId};
use eventbus_events::{EventInput, StoredEvent};

use super::r#trait::{
    AsyncOutboxTransaction, EventFilter, EventStore, EventStoreError, OutboxTransaction,
    RetentionScope,
};

/// Outbox schema, applied by [`PostgresEventStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_outbox_events.sql");

/// Postgres-backed outbox store.
///
/// `PgPool` is internally reference counted, so cloning the store is cheap and
/// clones share connections.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Option<Handle>,
}

impl PostgresEventStore {
    /// Create a store that resolves the tokio runtime from the calling context.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, runtime: None }
    }

    /// Create a store bound to a specific runtime, for use from plain threads.
    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime: Some(runtime),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn runtime(&self) -> Result<Handle, EventStoreError> {
        match &self.runtime {
            Some(handle) => Ok(handle.clone()),
            None => Handle::try_current().map_err(|_| {
                EventStoreError::Runtime(
                    "PostgresEventStore requires a tokio runtime; construct it with `with_runtime`"
                        .to_string(),
                )
            }),
        }
    }

    /// Create the outbox table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Begin a blocking transaction handle for use with the outbox writer.
    pub fn begin(&self) -> Result<PgOutboxTransaction, EventStoreError> {
        let runtime = self.runtime()?;
        let tx = runtime
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgOutboxTransaction { tx, runtime })
    }

    #[instrument(skip(self), fields(selected = tracing::field::Empty), err)]
    pub async fn select_unpublished_async(
        &self,
        limit: usize,
        excluded_topics: &[String],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                message_id,
                topic,
                event_type,
                content_type,
                partition_key,
                payload,
                created_at,
                published_at
            FROM outbox_events
            WHERE published_at IS NULL
              AND NOT (topic = ANY($2))
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(excluded_topics)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_unpublished", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = OutboxRow::from_row(&row)
                .map_err(|e| EventStoreError::Decode(e.to_string()))?;
            events.push(stored.try_into()?);
        }

        Span::current().record("selected", events.len());
        Ok(events)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn mark_published_async(
        &self,
        id: EventId,
        at: DateTime<Utc>,
    ) -> Result<bool, EventStoreError> {
        let result = sqlx::query("UPDATE outbox_events SET published_at = $2 WHERE id = $1")
            .bind(to_db_id(id)?)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(%cutoff, %scope, deleted = tracing::field::Empty), err)]
    pub async fn delete_older_than_async(
        &self,
        cutoff: DateTime<Utc>,
        scope: RetentionScope,
    ) -> Result<u64, EventStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE created_at < $1
                AND ($2 = FALSE OR published_at IS NOT NULL)
            "#,
        )
        .bind(cutoff)
        .bind(matches!(scope, RetentionScope::PublishedOnly))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        Span::current().record("deleted", result.rows_affected());
        Ok(result.rows_affected())
    }

    pub async fn count_async(&self, filter: &EventFilter) -> Result<u64, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM outbox_events
            WHERE ($1::text IS NULL OR topic = $1)
                AND ($2::bool IS NULL OR (published_at IS NOT NULL) = $2)
            "#,
        )
        .bind(filter.topic.as_deref())
        .bind(filter.published)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| EventStoreError::Decode(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }
}

impl EventStore for PostgresEventStore {
    fn select_unpublished_excluding(
        &self,
        limit: usize,
        excluded_topics: &[String],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.runtime()?
            .block_on(self.select_unpublished_async(limit, excluded_topics))
    }

    fn mark_published(&self, id: EventId, at: DateTime<Utc>) -> Result<bool, EventStoreError> {
        self.runtime()?.block_on(self.mark_published_async(id, at))
    }

    fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        scope: RetentionScope,
    ) -> Result<u64, EventStoreError> {
        self.runtime()?.block_on(self.delete_older_than_async(cutoff, scope))
    }

    fn count(&self, filter: &EventFilter) -> Result<u64, EventStoreError> {
        self.runtime()?.block_on(self.count_async(filter))
    }
}

/// Blocking wrapper around a `sqlx` transaction.
///
/// Business statements run on [`PgOutboxTransaction::connection`]; the outbox
/// insert runs through [`OutboxTransaction::insert_event`]. Dropping the value
/// without [`commit`](Self::commit) rolls the transaction back.
pub struct PgOutboxTransaction {
    tx: Transaction<'static, Postgres>,
    runtime: Handle,
}

impl PgOutboxTransaction {
    /// The connection the transaction runs on, for business statements.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Runtime handle to `block_on` business statements with.
    pub fn runtime(&self) -> Handle {
        self.runtime.clone()
    }

    pub fn commit(self) -> Result<(), EventStoreError> {
        self.runtime
            .block_on(self.tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    pub fn rollback(self) -> Result<(), EventStoreError> {
        self.runtime
            .block_on(self.tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

impl OutboxTransaction for PgOutboxTransaction {
    fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError> {
        self.runtime.block_on(insert_outbox_row(&mut self.tx, event))
    }
}

#[async_trait::async_trait]
impl AsyncOutboxTransaction for Transaction<'_, Postgres> {
    async fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError> {
        insert_outbox_row(self, event).await
    }
}

#[async_trait::async_trait]
impl AsyncOutboxTransaction for PgConnection {
    async fn insert_event(&mut self, event: EventInput) -> Result<StoredEvent, EventStoreError> {
        insert_outbox_row(self, event).await
    }
}

/// Insert one outbox row on the given connection (normally inside a transaction).
#[instrument(
    skip(conn, event),
    fields(topic = %event.topic, event_type = %event.event_type, event_id = tracing::field::Empty),
    err
)]
async fn insert_outbox_row(
    conn: &mut PgConnection,
    event: EventInput,
) -> Result<StoredEvent, EventStoreError> {
    event.validate()?;

    let message_id = MessageId::new();
    let created_at = Utc::now();

    let row = sqlx::query(
        r#"
        INSERT INTO outbox_events (
            message_id,
            topic,
            event_type,
            content_type,
            partition_key,
            payload,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(message_id.as_uuid())
    .bind(&event.topic)
    .bind(&event.event_type)
    .bind(&event.content_type)
    .bind(event.key.as_deref())
    .bind(&event.payload)
    .bind(created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_event", e))?;

    let id: i64 = row
        .try_get("id")
        .map_err(|e| EventStoreError::Decode(format!("failed to read id: {e}")))?;
    let id = from_db_id(id)?;
    Span::current().record("event_id", id.value());

    Ok(StoredEvent {
        id,
        message_id,
        topic: event.topic,
        event_type: event.event_type,
        content_type: event.content_type,
        key: event.key,
        payload: event.payload,
        created_at,
        published_at: None,
    })
}

fn to_db_id(id: EventId) -> Result<i64, EventStoreError> {
    i64::try_from(id.value())
        .map_err(|_| EventStoreError::Decode(format!("event id {id} exceeds BIGINT range")))
}

fn from_db_id(id: i64) -> Result<EventId, EventStoreError> {
    u64::try_from(id)
        .map(EventId::new)
        .map_err(|_| EventStoreError::Decode(format!("negative event id {id}")))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505" | "23503" | "23514") => EventStoreError::Constraint(msg),
                _ => EventStoreError::Database(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Decode(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Database(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    message_id: uuid::Uuid,
    topic: String,
    event_type: String,
    content_type: String,
    partition_key: Option<String>,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            topic: row.try_get("topic")?,
            event_type: row.try_get("event_type")?,
            content_type: row.try_get("content_type")?,
            partition_key: row.try_get("partition_key")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(StoredEvent {
            id: from_db_id(row.id)?,
            message_id: MessageId::from_uuid(row.message_id),
            topic: row.topic,
            event_type: row.event_type,
            content_type: row.content_type,
            key: row.partition_key,
            payload: row.payload,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}
