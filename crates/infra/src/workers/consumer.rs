//! Consumer runtime: one worker thread per subscription.
//!
//! The worker joins the consumer group, polls batches, hands each decoded
//! event to the handler, and commits according to the subscription's
//! [`CommitMode`] as directed by [`ConsumerGroupState`].
//!
//! A handler error or panic aborts the batch. The worker drops its broker
//! session without committing (crash semantics), waits `failure_backoff`, and
//! re-subscribes under the same member name; the broker then redelivers
//! everything that was not committed.
//!
//! Member names are derived from group, topic and a slot index (see
//! [`member_name`]), so a restarted process rejoins under the names its
//! previous incarnation used and picks up that member's unacknowledged work
//! on brokers that track it per member.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use eventbus_core::ConsumerGroupId;
use eventbus_events::{
    Broker, BrokerConsumer, CommitMode, ConsumerGroupState, Directive, HandlerError, Message,
    MessageHandler, MessagePosition, SubscribeOptions, TransitionError, envelope,
};

use super::{Tick, WorkerHandle, stop_requested, wait_tick};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Maximum messages per poll.
    pub batch_size: usize,
    /// How long a poll may block when nothing is available.
    pub poll_timeout: Duration,
    /// Broker-side commit timer for [`CommitMode::AutoCommit`].
    pub auto_commit_interval: Duration,
    /// Pause before re-subscribing after a failed batch or broker error.
    pub failure_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_timeout: Duration::from_millis(100),
            auto_commit_interval: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_auto_commit_interval(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub batches: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    /// Records without valid event headers; logged and treated as processed.
    pub messages_undecodable: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub session_resets: u64,
}

/// Member name for the `slot`-th worker of `group` on `topic`.
pub fn member_name(group: &ConsumerGroupId, topic: &str, slot: u32) -> String {
    format!("{group}.{topic}.{slot}")
}

/// Handle to a running subscription.
///
/// Cheap to clone; all clones control the same worker.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    topic: String,
    group: ConsumerGroupId,
    member: String,
    mode: CommitMode,
    worker: Arc<WorkerHandle>,
    state: Arc<Mutex<ConsumerGroupState>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &ConsumerGroupId {
        &self.group
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Stop the subscription and wait for the worker to leave the group.
    ///
    /// Idempotent. From inside the handler it only requests the stop.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Request the stop without waiting.
    pub(crate) fn stop_signal(&self) {
        self.worker.signal();
    }

    pub fn is_stopped(&self) -> bool {
        self.worker.is_finished()
    }

    /// Snapshot of the commit state machine.
    pub fn state(&self) -> ConsumerGroupState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Why a broker session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    Reset,
}

/// Consumer worker for one (topic, group) subscription.
pub struct ConsumerWorker<B> {
    broker: B,
    topic: String,
    group: ConsumerGroupId,
    mode: CommitMode,
    member: String,
    config: ConsumerConfig,
    handler: Box<dyn MessageHandler>,
    state: Arc<Mutex<ConsumerGroupState>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl<B> ConsumerWorker<B>
where
    B: Broker + 'static,
{
    /// Spawn a worker thread that consumes `topic` as `member` of `group`.
    ///
    /// `handler` must be idempotent: delivery is at-least-once.
    pub fn spawn<H>(
        broker: B,
        topic: impl Into<String>,
        group: ConsumerGroupId,
        member: impl Into<String>,
        mode: CommitMode,
        handler: H,
        config: ConsumerConfig,
    ) -> std::io::Result<ConsumerHandle>
    where
        H: MessageHandler,
    {
        let topic = topic.into();
        let member = member.into();
        let state = Arc::new(Mutex::new(ConsumerGroupState::new(
            topic.clone(),
            group.clone(),
            mode,
        )));
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));

        let worker = ConsumerWorker {
            broker,
            topic: topic.clone(),
            group: group.clone(),
            mode,
            member: member.clone(),
            config,
            handler: Box::new(handler),
            state: state.clone(),
            stats: stats.clone(),
        };

        let thread_name = format!("consumer-{topic}-{member}");
        let handle = WorkerHandle::spawn(thread_name, move |shutdown_rx| worker.run(shutdown_rx))?;

        Ok(ConsumerHandle {
            topic,
            group,
            member,
            mode,
            worker: Arc::new(handle),
            state,
            stats,
        })
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        let options = SubscribeOptions::new(self.member.clone());
        if self.mode.uses_broker_auto_commit() {
            options.with_auto_commit(self.config.auto_commit_interval)
        } else {
            options
        }
    }

    fn run(mut self, shutdown_rx: Receiver<()>) {
        info!(
            topic = %self.topic,
            group = %self.group,
            member = %self.member,
            mode = %self.mode,
            "consumer started"
        );

        loop {
            if stop_requested(&shutdown_rx) {
                break;
            }

            let mut consumer =
                match self
                    .broker
                    .subscribe(&self.topic, &self.group, self.subscribe_options())
                {
                    Ok(consumer) => consumer,
                    Err(err) => {
                        warn!(topic = %self.topic, group = %self.group, error = %err, "subscribe failed");
                        if wait_tick(&shutdown_rx, self.config.failure_backoff) == Tick::Stop {
                            break;
                        }
                        continue;
                    }
                };

            let end = match self.run_session(consumer.as_mut(), &shutdown_rx) {
                Ok(end) => end,
                Err(err) => {
                    error!(topic = %self.topic, group = %self.group, error = %err, "consumer state machine rejected a transition");
                    SessionEnd::Reset
                }
            };

            match end {
                SessionEnd::Stopped => {
                    consumer.close();
                    break;
                }
                SessionEnd::Reset => {
                    // Leave without committing anything further.
                    drop(consumer);
                    self.with_state(ConsumerGroupState::session_reset);
                    self.with_stats(|s| s.session_resets += 1);
                    debug!(
                        topic = %self.topic,
                        group = %self.group,
                        backoff_ms = self.config.failure_backoff.as_millis() as u64,
                        "consumer session reset"
                    );
                    if wait_tick(&shutdown_rx, self.config.failure_backoff) == Tick::Stop {
                        break;
                    }
                }
            }
        }

        self.with_state(ConsumerGroupState::stopped);
        info!(topic = %self.topic, group = %self.group, member = %self.member, "consumer stopped");
    }

    fn run_session(
        &mut self,
        consumer: &mut dyn BrokerConsumer,
        shutdown_rx: &Receiver<()>,
    ) -> Result<SessionEnd, TransitionError> {
        loop {
            if stop_requested(shutdown_rx) {
                return Ok(SessionEnd::Stopped);
            }

            self.transition(|s| s.poll_started())?;
            let batch = match consumer.poll(self.config.batch_size, self.config.poll_timeout) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(topic = %self.topic, group = %self.group, error = %err, "poll failed");
                    return Ok(SessionEnd::Reset);
                }
            };
            self.transition(|s| s.batch_received(&batch))?;
            if batch.is_empty() {
                continue;
            }
            self.with_stats(|s| s.batches += 1);

            for message in &batch {
                let directive = match self.dispatch(message) {
                    Ok(()) => {
                        self.with_stats(|s| s.messages_processed += 1);
                        self.transition(|s| s.message_succeeded(message.position()))?
                    }
                    Err(err) => {
                        warn!(
                            topic = %self.topic,
                            group = %self.group,
                            partition = message.partition,
                            offset = message.offset,
                            error = %err,
                            "handler failed; abandoning batch"
                        );
                        self.with_stats(|s| s.messages_failed += 1);
                        self.transition(|s| s.message_failed())?
                    }
                };
                if !self.follow(consumer, directive)? {
                    return Ok(SessionEnd::Reset);
                }
            }

            let directive = self.transition(|s| s.batch_completed())?;
            if !self.follow(consumer, directive)? {
                return Ok(SessionEnd::Reset);
            }
        }
    }

    /// Act on a directive. Returns `false` when the session must be reset.
    fn follow(
        &mut self,
        consumer: &mut dyn BrokerConsumer,
        directive: Directive,
    ) -> Result<bool, TransitionError> {
        match directive {
            Directive::Continue => Ok(true),
            Directive::AbortBatch => Ok(false),
            Directive::Commit(positions) => self.commit(consumer, &positions),
        }
    }

    fn commit(
        &mut self,
        consumer: &mut dyn BrokerConsumer,
        positions: &[MessagePosition],
    ) -> Result<bool, TransitionError> {
        match consumer.commit(positions) {
            Ok(()) => {
                self.transition(|s| s.commit_succeeded(positions))?;
                self.with_stats(|s| s.commits += 1);
                Ok(true)
            }
            Err(err) => {
                warn!(
                    topic = %self.topic,
                    group = %self.group,
                    positions = positions.len(),
                    error = %err,
                    "commit failed; uncommitted messages will be redelivered"
                );
                self.with_stats(|s| s.commit_failures += 1);
                Ok(false)
            }
        }
    }

    /// Decode and hand one message to the handler, converting panics into errors.
    fn dispatch(&mut self, message: &Message) -> Result<(), HandlerError> {
        let event = match envelope::from_message(message) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    topic = %self.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "skipping record without valid event headers"
                );
                self.with_stats(|s| s.messages_undecodable += 1);
                return Ok(());
            }
        };

        let handler = &mut self.handler;
        let group = &self.group;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(group, &event))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn transition<T>(
        &self,
        f: impl FnOnce(&mut ConsumerGroupState) -> Result<T, TransitionError>,
    ) -> Result<T, TransitionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state)
    }

    fn with_state(&self, f: impl FnOnce(&mut ConsumerGroupState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state);
    }

    fn with_stats(&self, f: impl FnOnce(&mut ConsumerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *stats);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
