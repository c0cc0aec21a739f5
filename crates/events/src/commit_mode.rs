//! Consumer commit modes and the per-group commit state machine.
//!
//! A consumer group cycles through
//! `Idle → Polling → Processing → Committing → Polling …`. The [`CommitMode`]
//! decides where the `Committing` step happens:
//!
//! | mode | commit point | redelivered after a failure |
//! |---|---|---|
//! | `AutoCommit` | broker client timer | whatever the timer had not yet committed (may also lose in-flight work) |
//! | `EndOfBatchCommit` | once, after every message of a batch succeeded | the whole batch |
//! | `MessageCommit` | after each successful message | the single failed message |
//!
//! [`ConsumerGroupState`] is pure: it performs no I/O and only tells the
//! worker what to do next through a [`Directive`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventbus_core::{ConsumerGroupId, DomainError};

use crate::broker::{Message, MessagePosition};

/// Offset-commit discipline for one subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommitMode {
    AutoCommit,
    #[default]
    EndOfBatchCommit,
    MessageCommit,
}

impl CommitMode {
    pub const ALL: [CommitMode; 3] = [
        CommitMode::AutoCommit,
        CommitMode::EndOfBatchCommit,
        CommitMode::MessageCommit,
    ];

    /// Whether commits are delegated to the broker client's own timer.
    pub fn uses_broker_auto_commit(self) -> bool {
        matches!(self, CommitMode::AutoCommit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommitMode::AutoCommit => "AutoCommit",
            CommitMode::EndOfBatchCommit => "EndOfBatchCommit",
            CommitMode::MessageCommit => "MessageCommit",
        }
    }
}

impl core::fmt::Display for CommitMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CommitMode {
    type Err = DomainError;

    /// Accepts `EndOfBatchCommit`, `end-of-batch-commit`, `end_of_batch_commit`, …
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "autocommit" | "auto" => Ok(CommitMode::AutoCommit),
            "endofbatchcommit" | "endofbatch" | "batch" => Ok(CommitMode::EndOfBatchCommit),
            "messagecommit" | "message" => Ok(CommitMode::MessageCommit),
            _ => Err(DomainError::validation(format!("unknown commit mode '{s}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    Committing,
    Stopped,
}

/// What the consumer worker must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Carry on with the next message (or the next poll).
    Continue,
    /// Commit these positions, then report back with
    /// [`ConsumerGroupState::commit_succeeded`].
    Commit(Vec<MessagePosition>),
    /// Stop the batch without committing and reset the broker session so the
    /// uncommitted messages are redelivered.
    AbortBatch,
}

/// First/last position of the batch currently being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBoundary {
    pub first: MessagePosition,
    pub last: MessagePosition,
    pub len: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid consumer transition from {from:?} on {event}")]
pub struct TransitionError {
    pub from: ConsumerState,
    pub event: &'static str,
}

/// In-memory state of one (topic, group) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupState {
    topic: String,
    group: ConsumerGroupId,
    mode: CommitMode,
    state: ConsumerState,

    /// Last committed next-offset per partition, as acknowledged by the broker.
    committed: BTreeMap<u32, u64>,

    in_flight: Option<BatchBoundary>,

    /// Processed, not yet committed (end-of-batch mode).
    pending: Vec<MessagePosition>,
}

impl ConsumerGroupState {
    pub fn new(topic: impl Into<String>, group: ConsumerGroupId, mode: CommitMode) -> Self {
        Self {
            topic: topic.into(),
            group,
            mode,
            state: ConsumerState::Idle,
            committed: BTreeMap::new(),
            in_flight: None,
            pending: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &ConsumerGroupId {
        &self.group
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn in_flight(&self) -> Option<&BatchBoundary> {
        self.in_flight.as_ref()
    }

    /// Committed next-offset for `partition`, as far as this consumer knows.
    pub fn committed_offset(&self, partition: u32) -> Option<u64> {
        self.committed.get(&partition).copied()
    }

    fn ensure(&self, allowed: &[ConsumerState], event: &'static str) -> Result<(), TransitionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                event,
            })
        }
    }

    pub fn poll_started(&mut self) -> Result<(), TransitionError> {
        self.ensure(
            &[ConsumerState::Idle, ConsumerState::Polling, ConsumerState::Committing],
            "poll_started",
        )?;
        self.state = ConsumerState::Polling;
        Ok(())
    }

    /// A poll returned. An empty batch keeps the group polling.
    pub fn batch_received(&mut self, batch: &[Message]) -> Result<(), TransitionError> {
        self.ensure(&[ConsumerState::Polling], "batch_received")?;
        self.pending.clear();

        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            self.in_flight = Some(BatchBoundary {
                first: first.position(),
                last: last.position(),
                len: batch.len(),
            });
            self.state = ConsumerState::Processing;
        }
        Ok(())
    }

    pub fn message_succeeded(&mut self, position: MessagePosition) -> Result<Directive, TransitionError> {
        self.ensure(&[ConsumerState::Processing], "message_succeeded")?;

        Ok(match self.mode {
            CommitMode::AutoCommit => Directive::Continue,
            CommitMode::EndOfBatchCommit => {
                self.pending.push(position);
                Directive::Continue
            }
            CommitMode::MessageCommit => {
                self.state = ConsumerState::Committing;
                Directive::Commit(vec![position])
            }
        })
    }

    /// The handler failed: every mode abandons the rest of the batch uncommitted.
    pub fn message_failed(&mut self) -> Result<Directive, TransitionError> {
        self.ensure(&[ConsumerState::Processing], "message_failed")?;
        self.pending.clear();
        self.in_flight = None;
        self.state = ConsumerState::Idle;
        Ok(Directive::AbortBatch)
    }

    /// Every message of the in-flight batch was handled successfully.
    pub fn batch_completed(&mut self) -> Result<Directive, TransitionError> {
        self.ensure(&[ConsumerState::Processing], "batch_completed")?;
        self.in_flight = None;

        match self.mode {
            CommitMode::EndOfBatchCommit if !self.pending.is_empty() => {
                self.state = ConsumerState::Committing;
                Ok(Directive::Commit(std::mem::take(&mut self.pending)))
            }
            _ => {
                self.state = ConsumerState::Polling;
                Ok(Directive::Continue)
            }
        }
    }

    /// The broker accepted a commit requested by a [`Directive::Commit`].
    pub fn commit_succeeded(&mut self, positions: &[MessagePosition]) -> Result<(), TransitionError> {
        self.ensure(&[ConsumerState::Committing], "commit_succeeded")?;
        for p in positions {
            let next = p.offset + 1;
            let entry = self.committed.entry(p.partition).or_insert(next);
            if next > *entry {
                *entry = next;
            }
        }
        self.state = if self.in_flight.is_some() {
            ConsumerState::Processing
        } else {
            ConsumerState::Polling
        };
        Ok(())
    }

    /// Broker session abandoned (handler failure, commit failure, poll error).
    pub fn session_reset(&mut self) {
        if self.state == ConsumerState::Stopped {
            return;
        }
        self.pending.clear();
        self.in_flight = None;
        self.state = ConsumerState::Idle;
    }

    pub fn stopped(&mut self) {
        self.pending.clear();
        self.in_flight = None;
        self.state = ConsumerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    use crate::broker::Headers;

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message {
                topic: "orders".into(),
                partition: 0,
                offset: i as u64,
                id: format!("0-{i}"),
                key: "orders".into(),
                headers: Headers::new(),
                payload: vec![],
                timestamp: Utc::now(),
            })
            .collect()
    }

    fn state(mode: CommitMode) -> ConsumerGroupState {
        ConsumerGroupState::new("orders", ConsumerGroupId::new("g").unwrap(), mode)
    }

    /// Drive one batch; `outcomes[i]` is whether message i's handler succeeded.
    /// Returns every commit the machine asked for.
    fn run_batch(sm: &mut ConsumerGroupState, outcomes: &[bool]) -> (Vec<Vec<u64>>, bool) {
        let batch = messages(outcomes.len());
        sm.poll_started().unwrap();
        sm.batch_received(&batch).unwrap();

        let mut commits = Vec::new();
        for (msg, ok) in batch.iter().zip(outcomes) {
            let directive = if *ok {
                sm.message_succeeded(msg.position()).unwrap()
            } else {
                sm.message_failed().unwrap()
            };
            match directive {
                Directive::Continue => {}
                Directive::Commit(positions) => {
                    sm.commit_succeeded(&positions).unwrap();
                    commits.push(positions.iter().map(|p| p.offset).collect());
                }
                Directive::AbortBatch => return (commits, true),
            }
        }

        if let Directive::Commit(positions) = sm.batch_completed().unwrap() {
            sm.commit_succeeded(&positions).unwrap();
            commits.push(positions.iter().map(|p| p.offset).collect());
        }
        (commits, false)
    }

    #[test]
    fn commit_modes_parse_from_config_spellings() {
        assert_eq!("EndOfBatchCommit".parse::<CommitMode>().unwrap(), CommitMode::EndOfBatchCommit);
        assert_eq!("message-commit".parse::<CommitMode>().unwrap(), CommitMode::MessageCommit);
        assert_eq!("auto_commit".parse::<CommitMode>().unwrap(), CommitMode::AutoCommit);
        assert!("sometimes".parse::<CommitMode>().is_err());
        for mode in CommitMode::ALL {
            assert_eq!(mode.to_string().parse::<CommitMode>().unwrap(), mode);
        }
    }

    #[test]
    fn end_of_batch_commits_once_after_the_whole_batch() {
        let mut sm = state(CommitMode::EndOfBatchCommit);
        let (commits, aborted) = run_batch(&mut sm, &[true, true, true]);
        assert!(!aborted);
        assert_eq!(commits, vec![vec![0, 1, 2]]);
        assert_eq!(sm.committed_offset(0), Some(3));
        assert_eq!(sm.state(), ConsumerState::Polling);
    }

    #[test]
    fn end_of_batch_failure_commits_nothing() {
        let mut sm = state(CommitMode::EndOfBatchCommit);
        let (commits, aborted) = run_batch(&mut sm, &[true, true, false, true]);
        assert!(aborted);
        assert!(commits.is_empty());
        assert_eq!(sm.committed_offset(0), None);
        assert_eq!(sm.state(), ConsumerState::Idle);
    }

    #[test]
    fn message_commit_commits_each_success_before_the_next_message() {
        let mut sm = state(CommitMode::MessageCommit);
        let (commits, aborted) = run_batch(&mut sm, &[true, true, false]);
        assert!(aborted);
        assert_eq!(commits, vec![vec![0], vec![1]]);
        assert_eq!(sm.committed_offset(0), Some(2));
    }

    #[test]
    fn auto_commit_never_commits_itself() {
        let mut sm = state(CommitMode::AutoCommit);
        let (commits, _) = run_batch(&mut sm, &[true, true]);
        assert!(commits.is_empty());
    }

    #[test]
    fn batch_boundary_tracks_in_flight_messages() {
        let mut sm = state(CommitMode::EndOfBatchCommit);
        sm.poll_started().unwrap();
        sm.batch_received(&messages(4)).unwrap();
        let boundary = sm.in_flight().unwrap();
        assert_eq!((boundary.first.offset, boundary.last.offset, boundary.len), (0, 3, 4));
    }

    #[test]
    fn empty_poll_keeps_polling() {
        let mut sm = state(CommitMode::MessageCommit);
        sm.poll_started().unwrap();
        sm.batch_received(&[]).unwrap();
        assert_eq!(sm.state(), ConsumerState::Polling);
        assert!(sm.in_flight().is_none());
    }

    #[test]
    fn stopped_consumers_reject_further_work() {
        let mut sm = state(CommitMode::MessageCommit);
        sm.stopped();
        sm.session_reset();
        assert_eq!(sm.state(), ConsumerState::Stopped);
        assert_eq!(
            sm.poll_started(),
            Err(TransitionError {
                from: ConsumerState::Stopped,
                event: "poll_started"
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: committed offsets never cover a message whose handler
        /// failed or that came after a failure in the same batch.
        #[test]
        fn commits_never_pass_a_failed_message(outcomes in prop::collection::vec(any::<bool>(), 1..40)) {
            let first_failure = outcomes.iter().position(|ok| !ok);

            for mode in CommitMode::ALL {
                let mut sm = state(mode);
                let (commits, aborted) = run_batch(&mut sm, &outcomes);
                let committed: Vec<u64> = commits.into_iter().flatten().collect();

                prop_assert_eq!(aborted, first_failure.is_some());
                if let Some(failed) = first_failure {
                    prop_assert!(committed.iter().all(|o| (*o as usize) < failed));
                }

                match mode {
                    CommitMode::AutoCommit => prop_assert!(committed.is_empty()),
                    CommitMode::EndOfBatchCommit => {
                        let expected: Vec<u64> = if first_failure.is_some() {
                            vec![]
                        } else {
                            (0..outcomes.len() as u64).collect()
                        };
                        prop_assert_eq!(committed, expected);
                    }
                    CommitMode::MessageCommit => {
                        let upto = first_failure.unwrap_or(outcomes.len()) as u64;
                        prop_assert_eq!(committed, (0..upto).collect::<Vec<u64>>());
                    }
                }
            }
        }
    }
}
