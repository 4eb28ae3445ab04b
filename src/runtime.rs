//! Runtime Assembly
//!
//! Builds the stores, limiter, executor, scheduler and drain loop from a
//! [`Config`]. Nothing is process-global: every component gets its
//! collaborators through its constructor.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::drain::QueueDrainLoop;
use crate::executor::{LogFileExecutor, TaskExecutor};
use crate::queue::{DelayedQueue, MemoryQueue};
use crate::rate_limit::{MemoryWindowStore, RateLimiter, WindowStore};
use crate::scheduler::AdmissionScheduler;
use crate::sqlite::SqliteStore;

/// Fully wired components for one process
#[derive(Clone)]
pub struct Runtime {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub limiter: Arc<RateLimiter>,
    pub queue: Arc<dyn DelayedQueue>,
    pub executor: Arc<dyn TaskExecutor>,
    pub scheduler: AdmissionScheduler,
}

impl Runtime {
    /// Wire everything against the system clock
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Wire everything against `clock`
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let visibility_timeout = config.drain.visibility_timeout();

        let (windows, queue): (Arc<dyn WindowStore>, Arc<dyn DelayedQueue>) =
            match config.store_backend()? {
                StoreBackend::Memory => {
                    let windows: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new());
                    let queue: Arc<dyn DelayedQueue> = Arc::new(MemoryQueue::new(visibility_timeout));
                    (windows, queue)
                }
                StoreBackend::Sqlite => {
                    let path = config
                        .store
                        .path
                        .as_ref()
                        .context("Store backend 'sqlite' requires store.path")?;
                    let store = Arc::new(
                        SqliteStore::open(path, visibility_timeout)
                            .with_context(|| format!("Failed to open SQLite store at {:?}", path))?,
                    );
                    let windows: Arc<dyn WindowStore> = store.clone();
                    let queue: Arc<dyn DelayedQueue> = store;
                    (windows, queue)
                }
            };

        let limiter = Arc::new(RateLimiter::new(config.limiter.clone(), windows, clock.clone()));
        let executor: Arc<dyn TaskExecutor> = Arc::new(LogFileExecutor::new(
            config.executor.log_path.clone(),
            clock.clone(),
        ));
        let scheduler = AdmissionScheduler::new(
            limiter.clone(),
            queue.clone(),
            executor.clone(),
            clock.clone(),
            config.retry.initial_delay(),
        );

        info!(
            backend = %config.store.backend,
            capacity = config.limiter.capacity,
            window_secs = config.limiter.window_secs,
            task_log = %config.executor.log_path.display(),
            "Runtime initialized"
        );

        Ok(Self {
            config,
            clock,
            limiter,
            queue,
            executor,
            scheduler,
        })
    }

    /// Drain loop sharing this runtime's limiter, queue and executor
    pub fn drain_loop(&self) -> QueueDrainLoop {
        QueueDrainLoop::new(
            self.limiter.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.clock.clone(),
            self.config.retry.clone(),
        )
        .with_poll_interval(self.config.drain.poll_interval())
        .with_sweep_interval(self.config.drain.sweep_interval())
    }
}
