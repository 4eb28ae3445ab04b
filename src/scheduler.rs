//! Admission Scheduler
//!
//! Synchronous request path: admit and run now, or park the task in the
//! delayed queue for the drain loop.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::executor::{TaskExecutor, TaskRecord};
use crate::identity::Identity;
use crate::metrics;
use crate::queue::{DelayedQueue, QueuedTask};
use crate::rate_limit::{Admission, Admitter};

/// What happened to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Admitted and executed before returning
    Executed(TaskRecord),
    /// Over capacity; deferred to the drain loop
    Queued(QueuedTask),
}

/// Request-path orchestrator
#[derive(Clone)]
pub struct AdmissionScheduler {
    admitter: Arc<dyn Admitter>,
    queue: Arc<dyn DelayedQueue>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,

    /// Fixed delay before a rejected submission is re-evaluated
    initial_delay: Duration,
}

impl AdmissionScheduler {
    pub fn new(
        admitter: Arc<dyn Admitter>,
        queue: Arc<dyn DelayedQueue>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
        initial_delay: Duration,
    ) -> Self {
        Self {
            admitter,
            queue,
            executor,
            clock,
            initial_delay,
        }
    }

    /// Admit and execute, or queue on rejection.
    ///
    /// The point charged on admission is kept even if the task body fails;
    /// the execution error is returned to the caller and nothing is queued.
    pub async fn submit(&self, identity: Identity) -> Result<SubmitOutcome> {
        match self.admitter.try_consume(&identity).await? {
            Admission::Admitted { .. } => match self.executor.run(&identity).await {
                Ok(record) => {
                    metrics::SUBMISSIONS_TOTAL.with_label_values(&["executed"]).inc();
                    metrics::TASKS_EXECUTED_TOTAL.with_label_values(&["request"]).inc();
                    Ok(SubmitOutcome::Executed(record))
                }
                Err(e) => {
                    error!(%identity, "Task failed on request path: {}", e);
                    metrics::SUBMISSIONS_TOTAL.with_label_values(&["failed"]).inc();
                    metrics::EXECUTION_FAILURES_TOTAL.with_label_values(&["request"]).inc();
                    Err(e)
                }
            },
            Admission::Rejected { retry_after } => {
                let task = QueuedTask::new(identity, self.clock.now(), self.initial_delay);
                self.queue.enqueue(task.clone()).await?;
                info!(
                    identity = %task.identity,
                    task_id = %task.id,
                    window_resets_in_ms = retry_after.as_millis() as u64,
                    "Task queued due to rate limit"
                );
                metrics::SUBMISSIONS_TOTAL.with_label_values(&["queued"]).inc();
                Ok(SubmitOutcome::Queued(task))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::GateError;
    use crate::queue::MemoryQueue;
    use crate::rate_limit::{MemoryWindowStore, RateLimitConfig, RateLimiter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that counts runs and can be told to fail
    #[derive(Default)]
    struct CountingExecutor {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn run(&self, identity: &Identity) -> Result<TaskRecord> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GateError::Execution {
                    identity: identity.to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(TaskRecord {
                identity: identity.clone(),
                completed_at: chrono::Utc::now(),
            })
        }
    }

    struct Harness {
        clock: ManualClock,
        queue: Arc<MemoryQueue>,
        executor: Arc<CountingExecutor>,
        limiter: Arc<RateLimiter>,
        scheduler: AdmissionScheduler,
    }

    fn harness(executor: CountingExecutor) -> Harness {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let executor = Arc::new(executor);
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(MemoryWindowStore::new()),
            Arc::new(clock.clone()),
        ));
        let scheduler = AdmissionScheduler::new(
            limiter.clone(),
            queue.clone(),
            executor.clone(),
            Arc::new(clock.clone()),
            Duration::from_millis(1000),
        );
        Harness {
            clock,
            queue,
            executor,
            limiter,
            scheduler,
        }
    }

    fn u1() -> Identity {
        Identity::new("u1").unwrap()
    }

    #[tokio::test]
    async fn test_twenty_first_submission_is_queued() {
        let h = harness(CountingExecutor::default());

        for _ in 0..20 {
            let outcome = h.scheduler.submit(u1()).await.unwrap();
            assert!(matches!(outcome, SubmitOutcome::Executed(_)));
        }

        let now = h.clock.now();
        match h.scheduler.submit(u1()).await.unwrap() {
            SubmitOutcome::Queued(task) => {
                assert!(task.not_before > now);
                assert_eq!(task.not_before.timestamp_millis() - now.timestamp_millis(), 1000);
                assert_eq!(task.attempt, 1);
            }
            other => panic!("expected Queued, got {:?}", other),
        }

        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 20);
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_other_identities_unaffected() {
        let h = harness(CountingExecutor::default());
        for _ in 0..21 {
            h.scheduler.submit(u1()).await.unwrap();
        }
        let outcome = h.scheduler.submit(Identity::new("u2").unwrap()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_execution_failure_propagates_without_refund() {
        let h = harness(CountingExecutor {
            fail: true,
            ..Default::default()
        });

        let err = h.scheduler.submit(u1()).await.unwrap_err();
        assert!(matches!(err, GateError::Execution { .. }));

        let window = h.limiter.window(&u1()).await.unwrap().unwrap();
        assert_eq!(window.points_consumed, 1);
        assert_eq!(h.queue.stats().await.unwrap().depth(), 0);
    }
}
