// Dead letter entries for tasks that will not be retried
//
// A task lands here when it exhausts its retry budget or when its body fails
// on the drain path. Entries are kept for operators; nothing re-drives them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{QueuedTask, RetryState};
use crate::identity::Identity;

/// Why a task was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Identity stayed over capacity for every allowed attempt
    RetriesExhausted,
    /// Admitted on a drain pass but the task body failed
    ExecutionFailed(String),
}

impl DeadLetterReason {
    /// Short label for metrics and the store
    pub fn label(&self) -> &'static str {
        match self {
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::ExecutionFailed(_) => "execution_failed",
        }
    }
}

/// Dead letter entry for an abandoned task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique ID for this DLQ entry
    pub id: String,
    /// Original task ID
    pub task_id: Uuid,
    /// Submitter
    pub identity: Identity,
    /// Rejected admissions the task went through
    pub attempts: u32,
    /// When the task first entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// When the task was moved to the DLQ
    pub buried_at: DateTime<Utc>,
    /// Why it was moved
    pub reason: DeadLetterReason,
}

impl DeadLetterEntry {
    /// Create a new DLQ entry from an abandoned task
    pub fn new(task: &QueuedTask, reason: DeadLetterReason, buried_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("dlq-{}", Uuid::new_v4()),
            task_id: task.id,
            identity: task.identity.clone(),
            attempts: task.attempt,
            enqueued_at: task.enqueued_at,
            buried_at,
            reason,
        }
    }

    pub fn state(&self) -> RetryState {
        RetryState::Exhausted {
            attempts: self.attempts,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting for their delay or ready but not yet claimed
    pub pending: usize,
    /// Claimed by a drain pass and not yet acked
    pub in_flight: usize,
    /// Entries in the dead letter queue
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Tasks still owed an execution
    pub fn depth(&self) -> usize {
        self.pending + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_dlq_create_entry() {
        let now = Utc::now();
        let mut task = QueuedTask::new(Identity::new("u1").unwrap(), now, Duration::from_secs(1));
        task.attempt = 11;

        let entry = DeadLetterEntry::new(&task, DeadLetterReason::RetriesExhausted, now);

        assert!(entry.id.starts_with("dlq-"));
        assert_eq!(entry.task_id, task.id);
        assert_eq!(entry.attempts, 11);
        assert_eq!(entry.state(), RetryState::Exhausted { attempts: 11 });
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_value(DeadLetterReason::ExecutionFailed("disk full".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "execution_failed", "detail": "disk full"})
        );
        assert_eq!(DeadLetterReason::RetriesExhausted.label(), "retries_exhausted");
    }

    #[test]
    fn test_stats_depth() {
        let stats = QueueStats {
            pending: 3,
            in_flight: 2,
            dead_lettered: 7,
        };
        assert_eq!(stats.depth(), 5);
    }
}
