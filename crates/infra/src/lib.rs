//! Infrastructure layer: outbox stores, brokers, background workers and the bus provider.

pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod outbox;
pub mod provider;
pub mod workers;


pub use config::{BusConfig, ConfigError};
pub use outbox::{OutboxError, OutboxWriter, TopicWriter};
pub use provider::{BusError, EventBusProvider};
