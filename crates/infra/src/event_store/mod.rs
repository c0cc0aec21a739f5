//! Outbox table boundary.
//!
//! The outbox writer inserts through a caller-owned [`OutboxTransaction`];
//! the relay and the cleanup loop work against [`EventStore`]. Two backends:
//! an in-memory one for tests/dev and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryEventStore, InMemoryTransaction};
pub use postgres::{PgOutboxTransaction, PostgresEventStore};
pub use r#trait::{
    AsyncOutboxTransaction, EventFilter, EventStore, EventStoreError, OutboxTransaction,
    RetentionScope,
};
