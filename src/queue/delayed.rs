//! Delayed Queue
//!
//! Storage contract for deferred tasks plus the lazy ready-task stream the
//! drain loop consumes.
//!
//! Claiming a task does not delete it: the task is hidden for the queue's
//! visibility timeout and only removed by [`DelayedQueue::ack`] or
//! [`DelayedQueue::bury`]. A consumer that dies mid-task therefore leaves the
//! task to reappear once the lease runs out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use super::dead_letter::{DeadLetterEntry, QueueStats};
use super::task::QueuedTask;
use crate::error::Result;

/// Store of tasks waiting for their delay to elapse
#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Append a task. Never blocks on capacity and never rejects.
    async fn enqueue(&self, task: QueuedTask) -> Result<()>;

    /// Claim the earliest-inserted task visible at `now`, hiding it for the
    /// visibility timeout. `None` when nothing is ready.
    ///
    /// Only the oldest task of each identity is eligible: a newer task for
    /// the same identity stays hidden until the older one is acked or buried.
    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>>;

    /// Remove a claimed task after it ran. Returns whether it was present.
    async fn ack(&self, id: Uuid) -> Result<bool>;

    /// Return a claimed task to pending with its updated attempt and delay
    async fn requeue(&self, task: &QueuedTask) -> Result<()>;

    /// Remove a task and record it in the dead letter queue
    async fn bury(&self, entry: DeadLetterEntry) -> Result<()>;

    /// Earliest time any task becomes visible
    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Dead letter entries, oldest first
    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;
}

/// Lazily yield every task ready at `now`, claiming each as it is pulled.
///
/// The stream ends when no ready task remains, or after yielding the first
/// store error. Tasks requeued during the pass carry a `not_before` later
/// than `now` and are not yielded again by the same stream.
pub fn poll_ready(
    queue: Arc<dyn DelayedQueue>,
    now: DateTime<Utc>,
) -> BoxStream<'static, Result<QueuedTask>> {
    stream::unfold(Some(queue), move |state| async move {
        let queue = state?;
        match queue.claim_ready(now).await {
            Ok(Some(task)) => Some((Ok(task), Some(queue))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}
