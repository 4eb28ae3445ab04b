//! Task Executor
//!
//! Runs the unit of work for an admitted identity. The production executor
//! appends one completion line per task to an append-only log and echoes it
//! through `tracing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::clock::Clock;
use crate::error::{GateError, Result};
use crate::identity::Identity;

/// Completion record written once per executed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub identity: Identity,
    pub completed_at: DateTime<Utc>,
}

impl TaskRecord {
    /// `<identity>-task completed at-<epoch ms>\n`
    pub fn log_line(&self) -> String {
        format!(
            "{}-task completed at-{}\n",
            self.identity,
            self.completed_at.timestamp_millis()
        )
    }
}

/// Side-effecting task body
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task for `identity`. Errors are [`GateError::Execution`].
    async fn run(&self, identity: &Identity) -> Result<TaskRecord>;
}

/// Executor that appends completion lines to a log file
#[derive(Debug)]
pub struct LogFileExecutor {
    path: PathBuf,
    clock: Arc<dyn Clock>,

    /// Serializes appends; held only while the line is written
    write_lock: Mutex<()>,
}

impl LogFileExecutor {
    /// Create an executor writing to `path`
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl TaskExecutor for LogFileExecutor {
    async fn run(&self, identity: &Identity) -> Result<TaskRecord> {
        let record = TaskRecord {
            identity: identity.clone(),
            completed_at: self.clock.now(),
        };
        let line = record.log_line();

        self.append(&line).await.map_err(|e| GateError::Execution {
            identity: identity.to_string(),
            message: format!("failed to append to {}: {}", self.path.display(), e),
        })?;

        info!(target: "taskgate::task", "{}", line.trim_end());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn u1() -> Identity {
        Identity::new("u1").unwrap()
    }

    #[test]
    fn test_log_line_format() {
        let record = TaskRecord {
            identity: u1(),
            completed_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        };
        assert_eq!(record.log_line(), "u1-task completed at-1700000000000\n");
    }

    #[tokio::test]
    async fn test_appends_one_line_per_task() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task.log");
        let clock = ManualClock::at_millis(1_700_000_000_000);
        let executor = LogFileExecutor::new(&path, Arc::new(clock.clone()));

        executor.run(&u1()).await.unwrap();
        clock.advance(Duration::from_millis(5));
        executor.run(&Identity::new("u2").unwrap()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "u1-task completed at-1700000000000\nu2-task completed at-1700000000005\n"
        );
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/logs/task.log");
        let executor = LogFileExecutor::new(&path, Arc::new(ManualClock::at_millis(0)));

        executor.run(&u1()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_path_is_execution_error() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for append
        let executor = LogFileExecutor::new(dir.path(), Arc::new(ManualClock::at_millis(0)));

        let err = executor.run(&u1()).await.unwrap_err();
        assert!(matches!(err, GateError::Execution { ref identity, .. } if identity == "u1"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task.log");
        let executor = Arc::new(LogFileExecutor::new(
            &path,
            Arc::new(ManualClock::at_millis(1_700_000_000_000)),
        ));

        let mut handles = Vec::new();
        for i in 0..50 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let id = Identity::new(format!("user-{}", i)).unwrap();
                executor.run(&id).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 50);
        assert!(contents
            .lines()
            .all(|l| l.starts_with("user-") && l.ends_with("-task completed at-1700000000000")));
    }
}
