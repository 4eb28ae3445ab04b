// Queue drain loop - re-runs admission for deferred tasks
//
// Manages:
// - Pulling tasks whose delay has elapsed
// - Executing admitted tasks and acking them
// - Re-queueing rejected tasks with backoff, dead-lettering exhausted ones
// - Periodic sweep of expired rate limit windows

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{until, Clock};
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::metrics;
use crate::queue::{
    poll_ready, DeadLetterEntry, DeadLetterReason, DelayedQueue, QueuedTask, RetryDecision,
    RetryPolicy,
};
use crate::rate_limit::{Admission, Admitter};

/// Shortest sleep between passes, so a store that keeps reporting ready
/// work cannot make the loop spin
const MIN_IDLE: Duration = Duration::from_millis(10);

/// What one drain pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub executed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Executed => self.executed += 1,
            TaskOutcome::Requeued => self.requeued += 1,
            TaskOutcome::Exhausted => self.dead_lettered += 1,
            TaskOutcome::Failed => self.failed += 1,
        }
    }
}

/// Fate of a single queued task on a drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Admitted and ran; removed from the queue
    Executed,
    /// Rejected again; back in the queue with a later `not_before`
    Requeued,
    /// Rejected too many times; dead-lettered
    Exhausted,
    /// Admitted but the task body failed; dead-lettered without retry
    Failed,
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Executed => "executed",
            TaskOutcome::Requeued => "requeued",
            TaskOutcome::Exhausted => "exhausted",
            TaskOutcome::Failed => "failed",
        }
    }
}

/// Background re-evaluation of queued tasks
#[derive(Clone)]
pub struct QueueDrainLoop {
    admitter: Arc<dyn Admitter>,
    queue: Arc<dyn DelayedQueue>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl QueueDrainLoop {
    pub fn new(
        admitter: Arc<dyn Admitter>,
        queue: Arc<dyn DelayedQueue>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            admitter,
            queue,
            executor,
            clock,
            policy,
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Upper bound on the sleep between passes
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How often expired rate limit windows are purged
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Process every task ready now, then return.
    ///
    /// A store error aborts the pass; any task already claimed stays hidden
    /// until its lease runs out and is then retried by a later pass.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let now = self.clock.now();
        let mut report = DrainReport::default();
        let mut ready = poll_ready(self.queue.clone(), now);

        while let Some(task) = ready.next().await {
            let outcome = self.process(task?).await?;
            metrics::DRAIN_TASKS_TOTAL
                .with_label_values(&[outcome.label()])
                .inc();
            report.record(outcome);
        }

        self.publish_stats().await;
        Ok(report)
    }

    /// Re-run admission for one claimed task
    pub async fn process(&self, mut task: QueuedTask) -> Result<TaskOutcome> {
        match self.admitter.try_consume(&task.identity).await? {
            Admission::Admitted { .. } => match self.executor.run(&task.identity).await {
                Ok(_) => {
                    self.queue.ack(task.id).await?;
                    metrics::TASKS_EXECUTED_TOTAL.with_label_values(&["drain"]).inc();
                    debug!(identity = %task.identity, task_id = %task.id, attempt = task.attempt, "Queued task executed");
                    Ok(TaskOutcome::Executed)
                }
                Err(e) => {
                    error!(identity = %task.identity, task_id = %task.id, "Error processing queued task: {}", e);
                    metrics::EXECUTION_FAILURES_TOTAL.with_label_values(&["drain"]).inc();
                    let entry = DeadLetterEntry::new(
                        &task,
                        DeadLetterReason::ExecutionFailed(e.to_string()),
                        self.clock.now(),
                    );
                    self.queue.bury(entry).await?;
                    Ok(TaskOutcome::Failed)
                }
            },
            Admission::Rejected { .. } => {
                let attempt = task.attempt.saturating_add(1);
                match self.policy.decide(attempt) {
                    RetryDecision::Retry(delay) => {
                        task.reschedule(self.clock.now(), delay);
                        self.queue.requeue(&task).await?;
                        debug!(
                            identity = %task.identity,
                            task_id = %task.id,
                            attempt = task.attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limit exceeded, requeuing"
                        );
                        Ok(TaskOutcome::Requeued)
                    }
                    RetryDecision::GiveUp => {
                        task.attempt = attempt;
                        let entry = DeadLetterEntry::new(
                            &task,
                            DeadLetterReason::RetriesExhausted,
                            self.clock.now(),
                        );
                        let dlq_id = entry.id.clone();
                        self.queue.bury(entry).await?;
                        warn!(
                            identity = %task.identity,
                            task_id = %task.id,
                            attempts = task.attempt,
                            "Retries exhausted, moved to DLQ: {}",
                            dlq_id
                        );
                        Ok(TaskOutcome::Exhausted)
                    }
                }
            }
        }
    }

    async fn publish_stats(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                metrics::QUEUE_DEPTH.set(stats.depth() as i64);
                metrics::DEAD_LETTERS.set(stats.dead_lettered as i64);
            }
            Err(e) => warn!("Failed to read queue stats: {}", e),
        }
    }

    /// Sleep until the next task is due, capped at the poll interval
    async fn idle_delay(&self) -> Duration {
        match self.queue.next_ready_at().await {
            Ok(Some(at)) => until(self.clock.now(), at)
                .min(self.poll_interval)
                .max(MIN_IDLE.min(self.poll_interval)),
            Ok(None) => self.poll_interval,
            Err(e) => {
                warn!("Failed to read next ready time: {}", e);
                self.poll_interval
            }
        }
    }

    /// Drain until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_attempts = self.policy.max_attempts,
            "Drain loop started"
        );
        let mut last_sweep = tokio::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.drain_once().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        executed = report.executed,
                        requeued = report.requeued,
                        dead_lettered = report.dead_lettered,
                        failed = report.failed,
                        "Drain pass completed"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Drain pass failed: {}", e),
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                if let Err(e) = self.admitter.sweep().await {
                    warn!("Rate limit sweep failed: {}", e);
                }
                last_sweep = tokio::time::Instant::now();
            }

            let delay = self.idle_delay().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Drain loop stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> DrainHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        DrainHandle { shutdown: tx, task }
    }
}

/// Handle to a spawned drain loop
pub struct DrainHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DrainHandle {
    /// Stop after the current pass and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Drain loop task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::error::GateError;
    use crate::executor::TaskRecord;
    use crate::identity::Identity;
    use crate::queue::{Backoff, MemoryQueue};
    use crate::rate_limit::{MemoryWindowStore, RateLimitConfig, RateLimiter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
        drain: QueueDrainLoop,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn harness(executor: CountingExecutor, policy: RetryPolicy) -> Harness {
        harness_with(executor, policy, RateLimitConfig::default())
    }

    fn harness_with(
        executor: CountingExecutor,
        policy: RetryPolicy,
        limits: RateLimitConfig,
    ) -> Harness {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let executor = Arc::new(executor);
        let limiter = Arc::new(RateLimiter::new(
            limits,
            Arc::new(MemoryWindowStore::new()),
            Arc::new(clock.clone()),
        ));
        let drain = QueueDrainLoop::new(
            limiter.clone(),
            queue.clone(),
            executor.clone(),
            Arc::new(clock.clone()),
            policy,
        );
        Harness {
            clock,
            queue,
            executor,
            limiter,
            drain,
        }
    }

    fn u1() -> Identity {
        Identity::new("u1").unwrap()
    }

    async fn exhaust(h: &Harness) {
        for _ in 0..20 {
            h.limiter.try_consume(&u1()).await.unwrap();
        }
    }

    async fn enqueue(h: &Harness) -> QueuedTask {
        let task = QueuedTask::new(u1(), h.clock.now(), Duration::from_millis(1000));
        h.queue.enqueue(task.clone()).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_not_ready_task_is_left_alone() {
        let h = harness(CountingExecutor::default(), policy());
        enqueue(&h).await;

        let report = h.drain.drain_once().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_ready_task_with_capacity_executes() {
        let h = harness(CountingExecutor::default(), policy());
        enqueue(&h).await;
        h.clock.advance(Duration::from_secs(1));

        let report = h.drain.drain_once().await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.stats().await.unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn test_rejected_task_requeued_with_backoff() {
        let h = harness(CountingExecutor::default(), policy());
        exhaust(&h).await;
        let original = enqueue(&h).await;
        h.clock.advance(Duration::from_secs(1));

        let report = h.drain.drain_once().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 0);

        // attempt 2 backs off 2s from now
        h.clock.advance(Duration::from_millis(1999));
        assert!(h.drain.drain_once().await.unwrap().is_empty());
        h.clock.advance(Duration::from_millis(1));
        let claimed = h.queue.claim_ready(h.clock.now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, original.id);
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn test_executes_after_window_reset() {
        let h = harness(CountingExecutor::default(), policy());
        exhaust(&h).await;
        enqueue(&h).await;

        let mut executed = 0;
        for _ in 0..120 {
            h.clock.advance(Duration::from_secs(1));
            executed += h.drain.drain_once().await.unwrap().executed;
        }

        assert_eq!(executed, 1);
        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.stats().await.unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn test_older_task_runs_before_newer_for_same_identity() {
        let h = harness_with(
            CountingExecutor::default(),
            policy(),
            RateLimitConfig::new(1, Duration::from_secs(60)),
        );
        h.limiter.try_consume(&u1()).await.unwrap();
        let older = enqueue(&h).await;

        let mut newer = None;
        for second in 1..=130 {
            h.clock.advance(Duration::from_secs(1));
            if second == 59 {
                newer = Some(enqueue(&h).await);
            }
            if h.drain.drain_once().await.unwrap().executed > 0 {
                break;
            }
        }
        let newer = newer.unwrap();

        // the older task ran first; the newer one is the only task left
        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);
        let far = h.clock.now() + chrono::TimeDelta::days(1);
        let left = h.queue.claim_ready(far).await.unwrap().unwrap();
        assert_eq!(left.id, newer.id);
        assert_ne!(left.id, older.id);
        assert!(h.queue.claim_ready(far).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_task_is_dead_lettered() {
        let h = harness(
            CountingExecutor::default(),
            RetryPolicy {
                backoff: Backoff::Fixed,
                max_attempts: 3,
                ..policy()
            },
        );
        exhaust(&h).await;
        enqueue(&h).await;

        let mut report = DrainReport::default();
        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(1));
            let pass = h.drain.drain_once().await.unwrap();
            report.requeued += pass.requeued;
            report.dead_lettered += pass.dead_lettered;
        }

        assert_eq!(report.requeued, 1);
        assert_eq!(report.dead_lettered, 1);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.depth(), 0);
        let dead = h.queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, DeadLetterReason::RetriesExhausted);
    }

    #[tokio::test]
    async fn test_execution_failure_dead_letters_without_retry() {
        let h = harness(
            CountingExecutor {
                fail: true,
                ..Default::default()
            },
            policy(),
        );
        enqueue(&h).await;
        h.clock.advance(Duration::from_secs(1));

        let report = h.drain.drain_once().await.unwrap();
        assert_eq!(report.failed, 1);

        h.clock.advance(Duration::from_secs(60));
        assert!(h.drain.drain_once().await.unwrap().is_empty());
        assert_eq!(h.executor.runs.load(Ordering::SeqCst), 1);

        let dead = h.queue.dead_letters().await.unwrap();
        assert!(matches!(dead[0].reason, DeadLetterReason::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_spawned_loop_drains_and_stops() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let executor = Arc::new(CountingExecutor::default());
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(MemoryWindowStore::new()),
            clock.clone(),
        ));
        queue
            .enqueue(QueuedTask::new(u1(), clock.now(), Duration::from_millis(20)))
            .await
            .unwrap();

        let handle = QueueDrainLoop::new(limiter, queue.clone(), executor.clone(), clock, policy())
            .with_poll_interval(Duration::from_millis(25))
            .spawn();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.unwrap().depth(), 0);
    }
}
