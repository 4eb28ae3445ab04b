// Prometheus metrics for admission and queue monitoring
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Submission outcomes (counter)
// - Drain pass outcomes (counter)
// - Executions and execution failures by path (counter)
// - Queue depth and dead letters (gauge)
// - Admission check latency (histogram)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("taskgate_submissions_total", "Submissions by outcome (executed, queued, failed)"),
        &["outcome"]
    ).expect("Failed to create submissions metric");

    pub static ref DRAIN_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("taskgate_drain_tasks_total", "Queued tasks processed by the drain loop by outcome"),
        &["outcome"]
    ).expect("Failed to create drain tasks metric");

    pub static ref TASKS_EXECUTED_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("taskgate_tasks_executed_total", "Tasks executed by path (request, drain)"),
        &["path"]
    ).expect("Failed to create tasks executed metric");

    pub static ref EXECUTION_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("taskgate_execution_failures_total", "Task bodies that failed after admission"),
        &["path"]
    ).expect("Failed to create execution failures metric");

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "taskgate_queue_depth",
        "Tasks waiting in or claimed from the delayed queue"
    ).expect("Failed to create queue depth metric");

    pub static ref DEAD_LETTERS: IntGauge = IntGauge::new(
        "taskgate_dead_letters",
        "Entries in the dead letter queue"
    ).expect("Failed to create dead letters metric");

    pub static ref ADMISSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("taskgate_admission_duration_seconds", "Time spent in the rate limit check"),
    ).expect("Failed to create admission duration metric");
}

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SUBMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRAIN_TASKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TASKS_EXECUTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(DEAD_LETTERS.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init() -> anyhow::Result<()> {
    INIT.get_or_init(|| register_all().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_includes_submissions() {
        init().unwrap();
        SUBMISSIONS_TOTAL.with_label_values(&["executed"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("taskgate_submissions_total"));
        assert!(text.contains("taskgate_queue_depth"));
    }
}
