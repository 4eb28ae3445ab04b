//! In-memory delayed queue
//!
//! Single-process backend. Tasks for one identity form a lane in insertion
//! order and only the head of each lane can be claimed, so a newer task never
//! overtakes an older one for the same identity. Lane heads are indexed by
//! visibility time and promoted into a ready set ordered by
//! `(enqueued_at, sequence)`, which keeps a claim logarithmic in queue size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::dead_letter::{DeadLetterEntry, QueueStats};
use super::delayed::DelayedQueue;
use super::task::QueuedTask;
use crate::clock::add_duration;
use crate::error::Result;
use crate::identity::Identity;

type SlotKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct Slot {
    task: QueuedTask,
    leased_until: Option<DateTime<Utc>>,
}

impl Slot {
    fn visible_at(&self) -> DateTime<Utc> {
        self.leased_until.unwrap_or(self.task.not_before)
    }
}

/// Where a lane head currently sits
#[derive(Debug, Clone, Copy)]
enum Placement {
    Waiting(DateTime<Utc>),
    Ready(DateTime<Utc>),
}

#[derive(Debug, Default)]
struct Lane {
    order: BTreeSet<SlotKey>,
    head: Option<(SlotKey, Placement)>,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<SlotKey, Slot>,
    index: HashMap<Uuid, SlotKey>,
    lanes: HashMap<Identity, Lane>,
    /// Lane heads not yet seen visible, by visibility time
    waiting: BTreeSet<(DateTime<Utc>, SlotKey)>,
    /// Lane heads seen visible, by insertion order
    ready: BTreeMap<SlotKey, DateTime<Utc>>,
    in_flight: usize,
    dead: Vec<DeadLetterEntry>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, task: QueuedTask) {
        let key = (task.enqueued_at, self.next_seq);
        self.next_seq += 1;
        let identity = task.identity.clone();
        self.index.insert(task.id, key);
        self.slots.insert(
            key,
            Slot {
                task,
                leased_until: None,
            },
        );
        self.lanes.entry(identity.clone()).or_default().order.insert(key);
        self.place_head(&identity);
    }

    fn remove(&mut self, id: &Uuid) -> Option<Slot> {
        let key = self.index.remove(id)?;
        let slot = self.slots.remove(&key)?;
        if slot.leased_until.is_some() {
            self.in_flight -= 1;
        }
        if let Some(lane) = self.lanes.get_mut(&slot.task.identity) {
            lane.order.remove(&key);
        }
        self.place_head(&slot.task.identity);
        Some(slot)
    }

    /// Re-index the head of `identity`'s lane after the lane changed
    fn place_head(&mut self, identity: &Identity) {
        let Some(lane) = self.lanes.get_mut(identity) else {
            return;
        };
        match lane.head.take() {
            Some((key, Placement::Waiting(at))) => {
                self.waiting.remove(&(at, key));
            }
            Some((key, Placement::Ready(_))) => {
                self.ready.remove(&key);
            }
            None => {}
        }

        let Some(&key) = lane.order.first() else {
            self.lanes.remove(identity);
            return;
        };
        if let Some(at) = self.slots.get(&key).map(Slot::visible_at) {
            self.waiting.insert((at, key));
            lane.head = Some((key, Placement::Waiting(at)));
        }
    }

    /// Move every head visible at `now` into the ready set
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(&(at, key)) = self.waiting.first() {
            if at > now {
                break;
            }
            self.waiting.pop_first();
            self.ready.insert(key, at);
            let lane = self
                .slots
                .get(&key)
                .and_then(|slot| self.lanes.get_mut(&slot.task.identity));
            if let Some(lane) = lane {
                lane.head = Some((key, Placement::Ready(at)));
            }
        }
    }

    fn claim(&mut self, now: DateTime<Utc>, lease: DateTime<Utc>) -> Option<QueuedTask> {
        self.promote(now);
        let (key, _) = self.ready.pop_first()?;
        let slot = self.slots.get_mut(&key)?;
        if slot.leased_until.replace(lease).is_none() {
            self.in_flight += 1;
        }
        let task = slot.task.clone();

        self.waiting.insert((lease, key));
        if let Some(lane) = self.lanes.get_mut(&task.identity) {
            lane.head = Some((key, Placement::Waiting(lease)));
        }
        Some(task)
    }

    fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        let waiting = self.waiting.first().map(|(at, _)| *at);
        let ready = self.ready.values().min().copied();
        waiting.into_iter().chain(ready).min()
    }
}

/// In-memory delayed queue
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    /// Create an empty queue whose claims last `visibility_timeout`
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl DelayedQueue for MemoryQueue {
    async fn enqueue(&self, task: QueuedTask) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(task);
        Ok(())
    }

    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>> {
        let mut state = self.state.lock().await;
        let lease = add_duration(now, self.visibility_timeout);
        Ok(state.claim(now, lease))
    }

    async fn ack(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.remove(&id).is_some())
    }

    async fn requeue(&self, task: &QueuedTask) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(key) = state.index.get(&task.id).copied() else {
            state.insert(task.clone());
            return Ok(());
        };
        if let Some(slot) = state.slots.get_mut(&key) {
            slot.task = task.clone();
            if slot.leased_until.take().is_some() {
                state.in_flight -= 1;
            }
        }
        state.place_head(&task.identity);
        Ok(())
    }

    async fn bury(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.remove(&entry.task_id);
        state.dead.push(entry);
        Ok(())
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.next_ready_at())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            pending: state.slots.len() - state.in_flight,
            in_flight: state.in_flight,
            dead_lettered: state.dead.len(),
        })
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let state = self.state.lock().await;
        Ok(state.dead.clone())
    }
}
