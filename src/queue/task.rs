//! Queued tasks
//!
//! A task deferred because its identity was over capacity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::add_duration;
use crate::identity::Identity;

/// Work item waiting in the delayed queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Unique task ID
    pub id: Uuid,

    /// Submitter the task runs for
    pub identity: Identity,

    /// When the task first entered the queue
    pub enqueued_at: DateTime<Utc>,

    /// Earliest time the task may be re-evaluated
    pub not_before: DateTime<Utc>,

    /// Rejected admissions so far (1 when created by a rejected submission)
    pub attempt: u32,
}

/// Where a task is in its retry life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetryState {
    /// Queued by the request path, not yet re-evaluated
    Pending,
    /// Rejected again on at least one drain pass
    Retrying { attempt: u32 },
    /// Gave up; lives in the dead-letter queue
    Exhausted { attempts: u32 },
}

impl QueuedTask {
    /// Task rejected at `now`, visible again after `delay`
    pub fn new(identity: Identity, now: DateTime<Utc>, delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            enqueued_at: now,
            not_before: add_duration(now, delay),
            attempt: 1,
        }
    }

    /// Whether the task may be yielded at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }

    /// Record another rejected admission and push the task back by `delay`
    pub fn reschedule(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.attempt = self.attempt.saturating_add(1);
        self.not_before = add_duration(now, delay).max(self.enqueued_at);
    }

    pub fn state(&self) -> RetryState {
        if self.attempt <= 1 {
            RetryState::Pending
        } else {
            RetryState::Retrying {
                attempt: self.attempt,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u1() -> Identity {
        Identity::new("u1").unwrap()
    }

    #[test]
    fn test_new_task_not_before_after_enqueue() {
        let now = Utc::now();
        let task = QueuedTask::new(u1(), now, Duration::from_millis(1000));
        assert!(task.not_before > task.enqueued_at);
        assert!(!task.is_ready(now));
        assert_eq!(task.attempt, 1);
        assert_eq!(task.state(), RetryState::Pending);
    }

    #[test]
    fn test_reschedule_advances() {
        let now = Utc::now();
        let mut task = QueuedTask::new(u1(), now, Duration::from_millis(1000));
        let later = task.not_before;
        task.reschedule(later, Duration::from_secs(2));

        assert_eq!(task.attempt, 2);
        assert_eq!(task.not_before, add_duration(later, Duration::from_secs(2)));
        assert_eq!(task.state(), RetryState::Retrying { attempt: 2 });
        assert_eq!(task.enqueued_at, now);
    }

    #[test]
    fn test_zero_delay_is_ready_immediately() {
        let now = Utc::now();
        let task = QueuedTask::new(u1(), now, Duration::ZERO);
        assert!(task.is_ready(now));
    }

    #[test]
    fn test_retry_state_serialization() {
        let json = serde_json::to_value(RetryState::Retrying { attempt: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "retrying", "attempt": 3}));
    }
}
