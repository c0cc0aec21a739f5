//! Bus provider: owns the relay, the cleanup loop and every consumer worker.
//!
//! There is no global instance. Construct one provider per store/broker pair
//! and pass it (or its writers) to the code that needs it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::info;

use eventbus_core::{ConsumerGroupId, DomainError};
use eventbus_events::{Broker, CommitMode, MessageHandler};

use crate::config::{BusConfig, ConfigError};
use crate::event_store::{EventStore, EventStoreError};
use crate::outbox::{OutboxError, OutboxWriter, TopicWriter};
use crate::workers::{
    CleanupLoop, CleanupStats, ConsumerHandle, ConsumerWorker, Relay, RelayStats, WorkerHandle,
    member_name,
};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<OutboxError> for BusError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Invalid(e) => BusError::Invalid(e),
            OutboxError::Closed => BusError::ShutDown,
            OutboxError::Store(e) => BusError::Store(e),
        }
    }
}

/// Running event bus.
///
/// `start` spawns the relay and cleanup threads; [`shutdown`](Self::shutdown)
/// (or dropping the provider) stops them and every consumer started through
/// [`subscribe`](Self::subscribe).
pub struct EventBusProvider<S, B>
where
    S: EventStore + 'static,
    B: Broker + 'static,
{
    config: BusConfig,
    store: Arc<S>,
    broker: Arc<B>,
    open: Arc<AtomicBool>,
    relay: Mutex<Option<WorkerHandle>>,
    cleanup: Mutex<Option<WorkerHandle>>,
    relay_stats: Arc<Mutex<RelayStats>>,
    cleanup_stats: Arc<Mutex<CleanupStats>>,
    consumers: Mutex<Vec<ConsumerHandle>>,
    writers: Mutex<HashMap<String, TopicWriter>>,
}

impl<S, B> EventBusProvider<S, B>
where
    S: EventStore + 'static,
    B: Broker + 'static,
{
    /// Validate `config` and start the relay and cleanup loops.
    pub fn start(config: BusConfig, store: Arc<S>, broker: Arc<B>) -> Result<Self, BusError> {
        config.validate()?;
        config.warn_if_risky();

        let relay = Relay::new(store.clone(), broker.clone(), config.relay());
        let relay_stats = relay.stats_handle();
        let relay = relay.spawn("eventbus-relay")?;

        let cleanup = CleanupLoop::new(store.clone(), config.cleanup());
        let cleanup_stats = cleanup.stats_handle();
        let cleanup = cleanup.spawn("eventbus-cleanup")?;

        info!(
            relay_poll_interval_ms = config.relay_poll_interval.as_millis() as u64,
            retention_secs = config.retention.as_secs(),
            default_commit_mode = %config.default_commit_mode,
            "event bus started"
        );

        Ok(Self {
            config,
            store,
            broker,
            open: Arc::new(AtomicBool::new(true)),
            relay: Mutex::new(Some(relay)),
            cleanup: Mutex::new(Some(cleanup)),
            relay_stats,
            cleanup_stats,
            consumers: Mutex::new(Vec::new()),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn is_shut_down(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_shut_down() {
            Err(BusError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Outbox writer tied to this provider's lifecycle.
    pub fn producer(&self) -> Result<OutboxWriter, BusError> {
        self.ensure_open()?;
        Ok(OutboxWriter::gated(self.open.clone()))
    }

    /// Per-topic writer, created on first request and reused afterwards.
    pub fn writer(&self, topic: &str) -> Result<TopicWriter, BusError> {
        self.ensure_open()?;
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = writers.get(topic) {
            return Ok(writer.clone());
        }
        let writer = OutboxWriter::gated(self.open.clone()).for_topic(topic)?;
        writers.insert(topic.to_string(), writer.clone());
        Ok(writer)
    }

    /// Start a consumer worker for `topic` in `group` with the given commit mode.
    pub fn subscribe<H>(
        &self,
        topic: &str,
        group: ConsumerGroupId,
        mode: CommitMode,
        handler: H,
    ) -> Result<ConsumerHandle, BusError>
    where
        H: MessageHandler,
    {
        if topic.trim().is_empty() {
            return Err(DomainError::validation("topic must not be empty").into());
        }

        // Checked under the lock so shutdown cannot miss a consumer started concurrently.
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        consumers.retain(|c| !c.is_stopped());

        // Lowest free slot: a restarted process reuses the same member names.
        let mut slot = 0;
        while consumers
            .iter()
            .any(|c| c.topic() == topic && c.group() == &group && c.member() == member_name(&group, topic, slot))
        {
            slot += 1;
        }
        let member = member_name(&group, topic, slot);

        let handle = ConsumerWorker::spawn(
            self.broker.clone(),
            topic,
            group,
            member,
            mode,
            handler,
            self.config.consumer.clone(),
        )?;
        consumers.push(handle.clone());
        Ok(handle)
    }

    /// Subscribe with the configured default commit mode.
    pub fn subscribe_default<H>(
        &self,
        topic: &str,
        group: ConsumerGroupId,
        handler: H,
    ) -> Result<ConsumerHandle, BusError>
    where
        H: MessageHandler,
    {
        self.subscribe(topic, group, self.config.default_commit_mode, handler)
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay_stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn cleanup_stats(&self) -> CleanupStats {
        self.cleanup_stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop every loop and consumer and wait for their threads to exit.
    ///
    /// Idempotent. In-flight handler calls finish; their batches are committed
    /// or redelivered according to the commit mode.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("event bus shutting down");

        let consumers: Vec<ConsumerHandle> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        // Signal everything first so the workers wind down in parallel.
        for consumer in &consumers {
            consumer.stop_signal();
        }
        for consumer in &consumers {
            consumer.stop();
        }

        for slot in [&self.relay, &self.cleanup] {
            let worker = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(worker) = worker {
                worker.stop();
            }
        }
        info!("event bus stopped");
    }
}

impl<S, B> Drop for EventBusProvider<S, B>
where
    S: EventStore + 'static,
    B: Broker + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
