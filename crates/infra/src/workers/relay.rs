//! Outbox relay: moves committed outbox rows to the broker.
//!
//! Each cycle publishes up to `batch_size` unpublished rows in id order and
//! marks each row published after the broker acknowledges it. A failed
//! publish leaves the row unpublished for the next cycle, and the rest of that
//! topic's rows are skipped for this cycle so per-topic order holds on the
//! broker. The cycle then selects again without the failed topics, so a
//! backlog on one broken topic never starves the others.
//!
//! A crash between the broker ack and the mark republishes the row on the next
//! cycle. Delivery is therefore at-least-once, never exactly-once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use eventbus_events::{Broker, envelope};

use super::{Tick, WorkerHandle, stop_requested, wait_tick};
use crate::event_store::{EventStore, EventStoreError};

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Pause between cycles when the previous cycle drained the backlog.
    pub poll_interval: Duration,
    /// Maximum publish attempts per cycle.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Result of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCycle {
    pub selected: usize,
    pub published: usize,
    pub failed: usize,
    /// Rows left for the next cycle because an earlier row of the same topic failed.
    pub deferred: usize,
}

impl RelayCycle {
    /// The cycle filled its batch without failures: more rows are probably waiting.
    fn saturated(&self, batch_size: usize) -> bool {
        self.selected >= batch_size && self.failed == 0 && self.deferred == 0
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RelayStats {
    pub cycles: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub store_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Outbox relay over an [`EventStore`] and a [`Broker`].
pub struct Relay<S, B> {
    store: S,
    broker: B,
    config: RelayConfig,
    stats: Arc<Mutex<RelayStats>>,
}

impl<S, B> Relay<S, B>
where
    S: EventStore + 'static,
    B: Broker + 'static,
{
    pub fn new(store: S, broker: B, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            config,
            stats: Arc::new(Mutex::new(RelayStats::default())),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<RelayStats>> {
        self.stats.clone()
    }

    /// Run a single relay cycle.
    ///
    /// Broker failures are absorbed (the row stays pending); store failures
    /// abort the cycle and are returned.
    pub fn run_once(&self) -> Result<RelayCycle, EventStoreError> {
        let result = self.relay_batch();

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.cycles += 1;
        stats.last_cycle_at = Some(Utc::now());
        match &result {
            Ok(cycle) => {
                stats.published += cycle.published as u64;
                stats.publish_failures += cycle.failed as u64;
            }
            Err(_) => stats.store_failures += 1,
        }
        result
    }

    fn relay_batch(&self) -> Result<RelayCycle, EventStoreError> {
        let mut cycle = RelayCycle::default();
        let mut blocked: Vec<String> = Vec::new();
        let mut budget = self.config.batch_size;

        // A topic that fails is excluded from further pages, so the remaining
        // budget goes to rows of other topics queued behind it.
        while budget > 0 {
            let page = self.store.select_unpublished_excluding(budget, &blocked)?;
            if page.is_empty() {
                break;
            }
            cycle.selected += page.len();
            let newly_blocked = blocked.len();

            for event in &page {
                if blocked.contains(&event.topic) {
                    cycle.deferred += 1;
                    continue;
                }
                budget -= 1;

                match self.broker.publish(envelope::to_record(event)) {
                    Ok(ack) => {
                        trace!(
                            event_id = %event.id,
                            topic = %ack.topic,
                            partition = ack.partition,
                            offset = ack.offset,
                            "broker acknowledged event"
                        );
                        if !self.store.mark_published(event.id, Utc::now())? {
                            debug!(event_id = %event.id, "outbox row removed before it could be marked published");
                        }
                        cycle.published += 1;
                    }
                    Err(err) => {
                        warn!(
                            event_id = %event.id,
                            topic = %event.topic,
                            error = %err,
                            "publish failed; event stays pending"
                        );
                        cycle.failed += 1;
                        blocked.push(event.topic.clone());
                    }
                }
            }

            if blocked.len() == newly_blocked {
                break;
            }
        }

        debug!(
            selected = cycle.selected,
            published = cycle.published,
            failed = cycle.failed,
            deferred = cycle.deferred,
            "relay cycle finished"
        );
        Ok(cycle)
    }

    /// Spawn the relay loop on its own thread.
    pub fn spawn(self, name: impl Into<String>) -> std::io::Result<WorkerHandle> {
        WorkerHandle::spawn(name, move |shutdown_rx| {
            info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "outbox relay started"
            );
            loop {
                let drain = match self.run_once() {
                    Ok(cycle) => cycle.saturated(self.config.batch_size),
                    Err(err) => {
                        warn!(error = %err, "relay cycle failed; retrying next interval");
                        false
                    }
                };

                if drain {
                    if stop_requested(&shutdown_rx) {
                        break;
                    }
                } else if wait_tick(&shutdown_rx, self.config.poll_interval) == Tick::Stop {
                    break;
                }
            }
            info!("outbox relay stopped");
        })
    }
}
