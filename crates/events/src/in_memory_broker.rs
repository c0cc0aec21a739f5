//! In-memory broker for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use eventbus_core::ConsumerGroupId;

use crate::broker::{
    Broker, BrokerConsumer, BrokerError, Headers, Message, MessagePosition, ProducerRecord,
    PublishAck, SubscribeOptions,
};

const DEFAULT_PARTITIONS: u32 = 4;

/// In-memory partitioned log with consumer groups.
///
/// - No IO / no async
/// - Records are kept for the lifetime of the broker
/// - Committed positions live per (topic, group); a new group starts from the
///   earliest record
/// - Membership changes bump the group generation and reassign partitions
///   round-robin; commits from a stale generation are rejected
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    partitions: u32,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    groups: HashMap<GroupKey, GroupState>,
    next_member: u64,
}

#[derive(Debug, Clone)]
struct Record {
    key: String,
    headers: Headers,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    topic: String,
    group: String,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next offset to consume, per partition.
    committed: HashMap<u32, u64>,
    members: Vec<Member>,
    generation: u64,
}

#[derive(Debug)]
struct Member {
    id: u64,
    name: String,
}

impl BrokerState {
    fn topic_mut(&mut self, topic: &str, partitions: u32) -> &mut Vec<Vec<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize])
    }
}

impl GroupState {
    fn commit(&mut self, partition: u32, next_offset: u64) {
        let entry = self.committed.entry(partition).or_insert(0);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    fn leave(&mut self, member: u64) {
        let before = self.members.len();
        self.members.retain(|m| m.id != member);
        if self.members.len() != before {
            self.generation += 1;
        }
    }
}

fn lock(shared: &Shared) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
    shared.state.lock().map_err(|_| BrokerError::Poisoned)
}

/// Partition a key maps to, for a topic with `partitions` partitions.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker whose topics are created with `partitions` partitions.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Number of records published to `topic` across all partitions.
    pub fn published_count(&self, topic: &str) -> usize {
        lock(&self.shared)
            .map(|s| s.topics.get(topic).map(|p| p.iter().map(Vec::len).sum()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Committed (next-to-consume) offset of `group` on one partition.
    pub fn committed_offset(
        &self,
        topic: &str,
        group: &ConsumerGroupId,
        partition: u32,
    ) -> Option<u64> {
        let state = lock(&self.shared).ok()?;
        let key = GroupKey {
            topic: topic.to_string(),
            group: group.as_str().to_string(),
        };
        state.groups.get(&key)?.committed.get(&partition).copied()
    }

    /// Current member count of `group` on `topic`.
    pub fn member_count(&self, topic: &str, group: &ConsumerGroupId) -> usize {
        let key = GroupKey {
            topic: topic.to_string(),
            group: group.as_str().to_string(),
        };
        lock(&self.shared)
            .map(|s| s.groups.get(&key).map(|g| g.members.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    fn publish(&self, record: ProducerRecord) -> Result<PublishAck, BrokerError> {
        let ack = {
            let mut state = lock(&self.shared)?;
            let partitions = state.topic_mut(&record.topic, self.partitions);
            let partition = partition_for(&record.key, partitions.len() as u32);
            let log = &mut partitions[partition as usize];
            let offset = log.len() as u64;
            log.push(Record {
                key: record.key,
                headers: record.headers,
                payload: record.payload,
                timestamp: Utc::now(),
            });
            PublishAck {
                topic: record.topic,
                partition,
                offset,
            }
        };

        self.shared.changed.notify_all();
        Ok(ack)
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &ConsumerGroupId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let key = GroupKey {
            topic: topic.to_string(),
            group: group.as_str().to_string(),
        };

        let member = {
            let mut state = lock(&self.shared)?;
            state.topic_mut(topic, self.partitions);
            let member = state.next_member;
            state.next_member += 1;

            let group_state = state.groups.entry(key.clone()).or_default();
            group_state.members.push(Member {
                id: member,
                name: options.member.clone(),
            });
            group_state.generation += 1;
            member
        };
        self.shared.changed.notify_all();

        debug!(topic, group = %group, member = %options.member, "member joined consumer group");

        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            key,
            member,
            name: options.member,
            generation: None,
            positions: BTreeMap::new(),
            auto_commit_interval: options.auto_commit_interval,
            last_auto_commit: Instant::now(),
            closed: false,
        }))
    }
}

/// Group member handle returned by [`InMemoryBroker::subscribe`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    key: GroupKey,
    member: u64,
    name: String,

    /// Generation the current assignment was computed for.
    generation: Option<u64>,

    /// Next offset to fetch, per assigned partition.
    positions: BTreeMap<u32, u64>,

    auto_commit_interval: Option<Duration>,
    last_auto_commit: Instant,
    closed: bool,
}

impl InMemoryConsumer {
    /// Recompute the partition assignment after a membership change.
    ///
    /// Positions restart from the group's committed offsets, which is what
    /// makes uncommitted work visible again after a rebalance.
    fn sync_assignment(&mut self, state: &BrokerState) -> Result<(), BrokerError> {
        let group = state
            .groups
            .get(&self.key)
            .ok_or_else(|| BrokerError::UnknownMember(self.name.clone()))?;
        let index = group
            .members
            .iter()
            .position(|m| m.id == self.member)
            .ok_or_else(|| BrokerError::UnknownMember(self.name.clone()))?;

        if self.generation == Some(group.generation) {
            return Ok(());
        }

        let partitions = state
            .topics
            .get(&self.key.topic)
            .map(|p| p.len() as u32)
            .unwrap_or(0);
        let members = group.members.len();

        self.positions = (0..partitions)
            .filter(|p| *p as usize % members == index)
            .map(|p| (p, group.committed.get(&p).copied().unwrap_or(0)))
            .collect();
        self.generation = Some(group.generation);

        debug!(
            topic = %self.key.topic,
            group = %self.key.group,
            member = %self.name,
            generation = group.generation,
            partitions = ?self.positions.keys().collect::<Vec<_>>(),
            "partition assignment updated"
        );
        Ok(())
    }

    fn maybe_auto_commit(&mut self, state: &mut BrokerState) {
        let Some(interval) = self.auto_commit_interval else {
            return;
        };
        if self.last_auto_commit.elapsed() < interval {
            return;
        }
        self.last_auto_commit = Instant::now();
        self.commit_positions(state);
    }

    fn commit_positions(&self, state: &mut BrokerState) {
        if let Some(group) = state.groups.get_mut(&self.key) {
            if self.generation == Some(group.generation) {
                for (partition, next) in &self.positions {
                    group.commit(*partition, *next);
                }
            }
        }
    }

    fn fetch(&mut self, state: &BrokerState, max_messages: usize) -> Vec<Message> {
        let Some(partitions) = state.topics.get(&self.key.topic) else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        for (partition, next) in self.positions.iter_mut() {
            let Some(log) = partitions.get(*partition as usize) else {
                continue;
            };
            while batch.len() < max_messages.max(1) {
                let Some(record) = log.get(*next as usize) else {
                    break;
                };
                batch.push(Message {
                    topic: self.key.topic.clone(),
                    partition: *partition,
                    offset: *next,
                    id: format!("{partition}-{next}"),
                    key: record.key.clone(),
                    headers: record.headers.clone(),
                    payload: record.payload.clone(),
                    timestamp: record.timestamp,
                });
                *next += 1;
            }
        }
        batch
    }

    fn leave(&mut self) {
        self.closed = true;
        if let Ok(mut state) = lock(&self.shared) {
            if let Some(group) = state.groups.get_mut(&self.key) {
                group.leave(self.member);
            }
        }
        self.shared.changed.notify_all();
    }
}

impl BrokerConsumer for InMemoryConsumer {
    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<Vec<Message>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        let mut state = lock(&shared)?;

        loop {
            self.sync_assignment(&state)?;
            self.maybe_auto_commit(&mut state);

            let batch = self.fetch(&state, max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let (guard, _) = shared
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Poisoned)?;
            state = guard;
        }
    }

    fn commit(&mut self, positions: &[MessagePosition]) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let shared = Arc::clone(&self.shared);
        let mut state = lock(&shared)?;
        let group = state
            .groups
            .get_mut(&self.key)
            .ok_or_else(|| BrokerError::UnknownMember(self.name.clone()))?;

        if !group.members.iter().any(|m| m.id == self.member) {
            return Err(BrokerError::UnknownMember(self.name.clone()));
        }
        if self.generation != Some(group.generation) {
            return Err(BrokerError::Rebalanced);
        }
        if positions
            .iter()
            .any(|p| p.topic != self.key.topic || !self.positions.contains_key(&p.partition))
        {
            return Err(BrokerError::Rebalanced);
        }

        for p in positions {
            group.commit(p.partition, p.offset + 1);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.auto_commit_interval.is_some() {
            if let Ok(mut state) = lock(&self.shared) {
                self.commit_positions(&mut state);
            }
        }
        self.leave();
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            // Crash semantics: leave without committing anything further.
            self.leave();
        }
    }
}
