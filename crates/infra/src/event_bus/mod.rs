//! Infrastructure broker implementations.
//!
//! The broker capability and the in-memory broker live in `eventbus-events`
//! as pure mechanics. This module provides networked brokers (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConsumer};
