//! Broker capability (publish / subscribe / commit), mechanics only.
//!
//! The relay publishes through [`Broker::publish`]; consumer workers obtain a
//! [`BrokerConsumer`] per subscription and drive it with `poll` / `commit`.
//!
//! ## Delivery Model
//!
//! - **Topics** are split into partitions; a record's key selects its partition,
//!   so records sharing a key keep their publish order.
//! - **Consumer groups** track a committed position per partition. Members of
//!   the same group split the partitions between them; distinct groups each see
//!   every record.
//! - **At-least-once**: anything not committed is redelivered after the member
//!   leaves, crashes, or the group rebalances. Consumers must be idempotent.
//!
//! The broker is authoritative for committed positions; the consumer runtime
//! only keeps an in-memory view of them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use eventbus_core::ConsumerGroupId;

/// Record headers (string-valued, ordered for deterministic encoding).
pub type Headers = BTreeMap<String, String>;

/// A record handed to [`Broker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

/// Broker acknowledgment of a durable publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// A record delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,

    /// Monotonic position within the partition.
    pub offset: u64,

    /// Broker-native identifier (e.g. a stream entry id).
    pub id: String,

    pub key: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn position(&self) -> MessagePosition {
        MessagePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            id: self.id.clone(),
        }
    }
}

/// Identifies a processed message when committing.
///
/// Offset-based brokers commit `offset + 1` per partition; acknowledgment-based
/// brokers acknowledge `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub id: String,
}

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Member name within the group. Re-subscribing under the same name resumes
    /// that member's unacknowledged work on brokers that track it per member.
    pub member: String,

    /// When set, the broker client commits consumed positions on this timer,
    /// independently of processing.
    pub auto_commit_interval: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            auto_commit_interval: None,
        }
    }

    pub fn with_auto_commit(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = Some(interval);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("consumer group rebalanced; uncommitted work will be redelivered")]
    Rebalanced,

    #[error("unknown consumer group member: {0}")]
    UnknownMember(String),

    #[error("consumer is closed")]
    Closed,

    /// Internal lock poisoning.
    #[error("broker state poisoned")]
    Poisoned,
}

/// Publish/subscribe transport.
///
/// Implementations must be safe to share across threads: the relay publishes
/// while consumer workers subscribe concurrently.
pub trait Broker: Send + Sync {
    /// Publish one record and wait for the broker to acknowledge it.
    fn publish(&self, record: ProducerRecord) -> Result<PublishAck, BrokerError>;

    /// Join `group` on `topic` and return a member handle.
    fn subscribe(
        &self,
        topic: &str,
        group: &ConsumerGroupId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn publish(&self, record: ProducerRecord) -> Result<PublishAck, BrokerError> {
        (**self).publish(record)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &ConsumerGroupId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        (**self).subscribe(topic, group, options)
    }
}

/// One member of a consumer group.
///
/// Designed for single-threaded use by the worker that owns it.
pub trait BrokerConsumer: Send {
    /// Fetch up to `max_messages`, blocking for at most `timeout` when nothing
    /// is available. Returns an empty batch on timeout.
    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<Vec<Message>, BrokerError>;

    /// Commit processed messages for this member's group.
    fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError>;

    /// Leave the group gracefully. With auto-commit enabled, consumed positions
    /// are committed first. Dropping a consumer without closing it behaves like
    /// a crash: nothing further is committed.
    fn close(&mut self);
}
