//! SQLite Store
//!
//! Durable backend for both the window store and the delayed queue. One
//! database file holds rate windows, queued tasks and dead letters, so a
//! `serve` process and a separate `worker` process share the same state and
//! nothing is lost across restarts.
//!
//! The connection sits behind a blocking mutex and every call runs on
//! `spawn_blocking`. Consumption and claiming run in `IMMEDIATE` transactions
//! so concurrent processes cannot both take the last point or the same task.
//!
//! Queued tasks carry a `lane_state`: `NULL` for a task queued behind an older
//! one of the same identity, `waiting` for a lane head not yet visible (or
//! leased), and `ready` for a head seen visible. Claims promote visible heads
//! and take the first `ready` row in insertion order, both through indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::clock::add_duration;
use crate::error::{GateError, Result};
use crate::identity::Identity;
use crate::queue::{DeadLetterEntry, DeadLetterReason, DelayedQueue, QueueStats, QueuedTask};
use crate::rate_limit::window::consume_from;
use crate::rate_limit::{Admission, ConsumptionWindow, WindowLimits, WindowStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rate_windows (
    identity        TEXT PRIMARY KEY,
    points_consumed INTEGER NOT NULL,
    window_start_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS queued_tasks (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    identity        TEXT NOT NULL,
    enqueued_at_ms  INTEGER NOT NULL,
    not_before_ms   INTEGER NOT NULL,
    attempt         INTEGER NOT NULL,
    leased_until_ms INTEGER,
    visible_at_ms   INTEGER NOT NULL,
    lane_state      TEXT
);
CREATE INDEX IF NOT EXISTS idx_queued_tasks_order
    ON queued_tasks (enqueued_at_ms, seq);
CREATE INDEX IF NOT EXISTS idx_queued_tasks_lane
    ON queued_tasks (identity, enqueued_at_ms, seq);
CREATE INDEX IF NOT EXISTS idx_queued_tasks_heads
    ON queued_tasks (identity) WHERE lane_state IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_queued_tasks_visible
    ON queued_tasks (lane_state, visible_at_ms);
CREATE INDEX IF NOT EXISTS idx_queued_tasks_ready
    ON queued_tasks (lane_state, enqueued_at_ms, seq);
CREATE TABLE IF NOT EXISTS dead_letters (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    task_id        TEXT NOT NULL,
    identity       TEXT NOT NULL,
    attempts       INTEGER NOT NULL,
    enqueued_at_ms INTEGER NOT NULL,
    buried_at_ms   INTEGER NOT NULL,
    reason         TEXT NOT NULL,
    detail         TEXT
);
";

/// SQLite-backed window store and delayed queue
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    visibility_timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>, visibility_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                GateError::Store(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;
        // WAL lets a reader process and a writer process overlap
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite store");
        Self::init(conn, visibility_timeout)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory(visibility_timeout: Duration) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, visibility_timeout)
    }

    fn init(conn: Connection, visibility_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            visibility_timeout,
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| GateError::Store("sqlite connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await?
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| GateError::Store(format!("timestamp out of range: {}", ms)))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| GateError::Store(format!("corrupt task id {}: {}", raw, e)))
}

fn parse_identity(raw: String) -> Result<Identity> {
    Identity::new(raw).map_err(|_| GateError::Store("corrupt identity: empty".to_string()))
}

/// Raw `queued_tasks` row
struct TaskRow {
    id: String,
    identity: String,
    enqueued_at_ms: i64,
    not_before_ms: i64,
    attempt: u32,
}

impl TaskRow {
    const COLUMNS: &'static str = "id, identity, enqueued_at_ms, not_before_ms, attempt";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity: row.get(1)?,
            enqueued_at_ms: row.get(2)?,
            not_before_ms: row.get(3)?,
            attempt: row.get(4)?,
        })
    }

    fn into_task(self) -> Result<QueuedTask> {
        Ok(QueuedTask {
            id: parse_uuid(&self.id)?,
            identity: parse_identity(self.identity)?,
            enqueued_at: from_millis(self.enqueued_at_ms)?,
            not_before: from_millis(self.not_before_ms)?,
            attempt: self.attempt,
        })
    }
}

/// Raw `dead_letters` row
struct DeadLetterRow {
    id: String,
    task_id: String,
    identity: String,
    attempts: u32,
    enqueued_at_ms: i64,
    buried_at_ms: i64,
    reason: String,
    detail: Option<String>,
}

impl DeadLetterRow {
    fn into_entry(self) -> Result<DeadLetterEntry> {
        let reason = match self.reason.as_str() {
            "retries_exhausted" => DeadLetterReason::RetriesExhausted,
            "execution_failed" => DeadLetterReason::ExecutionFailed(self.detail.unwrap_or_default()),
            other => return Err(GateError::Store(format!("unknown dead letter reason: {}", other))),
        };
        Ok(DeadLetterEntry {
            id: self.id,
            task_id: parse_uuid(&self.task_id)?,
            identity: parse_identity(self.identity)?,
            attempts: self.attempts,
            enqueued_at: from_millis(self.enqueued_at_ms)?,
            buried_at: from_millis(self.buried_at_ms)?,
            reason,
        })
    }
}

#[async_trait]
impl WindowStore for SqliteStore {
    async fn consume(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
        limits: WindowLimits,
    ) -> Result<Admission> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = tx
                .query_row(
                    "SELECT points_consumed, window_start_ms FROM rate_windows WHERE identity = ?1",
                    params![identity.as_str()],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            let existing = match existing {
                Some((points_consumed, start_ms)) => Some(ConsumptionWindow {
                    points_consumed,
                    window_start: from_millis(start_ms)?,
                }),
                None => None,
            };

            let (window, admission) = consume_from(existing, now, limits);
            tx.execute(
                "INSERT INTO rate_windows (identity, points_consumed, window_start_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(identity) DO UPDATE SET
                     points_consumed = excluded.points_consumed,
                     window_start_ms = excluded.window_start_ms",
                params![
                    identity.as_str(),
                    window.points_consumed,
                    window.window_start.timestamp_millis()
                ],
            )?;
            tx.commit()?;
            Ok(admission)
        })
        .await
    }

    async fn get(&self, identity: &Identity) -> Result<Option<ConsumptionWindow>> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT points_consumed, window_start_ms FROM rate_windows WHERE identity = ?1",
                    params![identity.as_str()],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            match row {
                Some((points_consumed, start_ms)) => Ok(Some(ConsumptionWindow {
                    points_consumed,
                    window_start: from_millis(start_ms)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limits: WindowLimits) -> Result<usize> {
        let window_ms = limits.window.as_millis().min(i64::MAX as u128) as i64;
        self.with_conn(move |conn| {
            let purged = conn.execute(
                "DELETE FROM rate_windows WHERE window_start_ms + ?1 <= ?2",
                params![window_ms, now.timestamp_millis()],
            )?;
            Ok(purged)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM rate_windows", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

fn insert_task(conn: &Connection, task: &QueuedTask) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO queued_tasks
             (id, identity, enqueued_at_ms, not_before_ms, attempt, visible_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?4)",
        params![
            task.id.to_string(),
            task.identity.as_str(),
            task.enqueued_at.timestamp_millis(),
            task.not_before.timestamp_millis(),
            task.attempt
        ],
    )?;
    place_head(conn, task.identity.as_str())
}

/// Make the oldest task of `identity` the only claimable one in its lane
fn place_head(conn: &Connection, identity: &str) -> rusqlite::Result<()> {
    let head: Option<i64> = conn
        .query_row(
            "SELECT seq FROM queued_tasks WHERE identity = ?1
             ORDER BY enqueued_at_ms, seq LIMIT 1",
            params![identity],
            |row| row.get(0),
        )
        .optional()?;
    conn.execute(
        "UPDATE queued_tasks SET lane_state = NULL
         WHERE identity = ?1 AND lane_state IS NOT NULL AND seq IS NOT ?2",
        params![identity, head],
    )?;
    if let Some(seq) = head {
        conn.execute(
            "UPDATE queued_tasks SET lane_state = 'waiting'
             WHERE seq = ?1 AND lane_state IS NULL",
            params![seq],
        )?;
    }
    Ok(())
}

#[async_trait]
impl DelayedQueue for SqliteStore {
    async fn enqueue(&self, task: QueuedTask) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_task(&tx, &task)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn claim_ready(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>> {
        let now_ms = now.timestamp_millis();
        let lease_ms = add_duration(now, self.visibility_timeout).timestamp_millis();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE queued_tasks SET lane_state = 'ready'
                 WHERE lane_state = 'waiting' AND visible_at_ms <= ?1",
                params![now_ms],
            )?;
            let row = tx
                .query_row(
                    &format!(
                        "SELECT seq, {} FROM queued_tasks
                         WHERE lane_state = 'ready'
                         ORDER BY enqueued_at_ms, seq
                         LIMIT 1",
                        TaskRow::COLUMNS
                    ),
                    [],
                    |row| {
                        let seq: i64 = row.get(0)?;
                        let task = TaskRow {
                            id: row.get(1)?,
                            identity: row.get(2)?,
                            enqueued_at_ms: row.get(3)?,
                            not_before_ms: row.get(4)?,
                            attempt: row.get(5)?,
                        };
                        Ok((seq, task))
                    },
                )
                .optional()?;

            let Some((seq, task)) = row else {
                tx.commit()?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE queued_tasks
                 SET leased_until_ms = ?1, visible_at_ms = ?1, lane_state = 'waiting'
                 WHERE seq = ?2",
                params![lease_ms, seq],
            )?;
            tx.commit()?;
            task.into_task().map(Some)
        })
        .await
    }

    async fn ack(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let identity: Option<String> = tx
                .query_row(
                    "DELETE FROM queued_tasks WHERE id = ?1 RETURNING identity",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(identity) = &identity {
                place_head(&tx, identity)?;
            }
            tx.commit()?;
            Ok(identity.is_some())
        })
        .await
    }

    async fn requeue(&self, task: &QueuedTask) -> Result<()> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE queued_tasks
                 SET not_before_ms = ?1, attempt = ?2, leased_until_ms = NULL,
                     visible_at_ms = ?1,
                     lane_state = CASE WHEN lane_state IS NULL THEN NULL ELSE 'waiting' END
                 WHERE id = ?3",
                params![
                    task.not_before.timestamp_millis(),
                    task.attempt,
                    task.id.to_string()
                ],
            )?;
            if updated == 0 {
                insert_task(&tx, &task)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn bury(&self, entry: DeadLetterEntry) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM queued_tasks WHERE id = ?1",
                params![entry.task_id.to_string()],
            )?;
            place_head(&tx, entry.identity.as_str())?;
            let detail = match &entry.reason {
                DeadLetterReason::ExecutionFailed(message) => Some(message.as_str()),
                DeadLetterReason::RetriesExhausted => None,
            };
            tx.execute(
                "INSERT INTO dead_letters
                     (id, task_id, identity, attempts, enqueued_at_ms, buried_at_ms, reason, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.task_id.to_string(),
                    entry.identity.as_str(),
                    entry.attempts,
                    entry.enqueued_at.timestamp_millis(),
                    entry.buried_at.timestamp_millis(),
                    entry.reason.label(),
                    detail
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let mut next: Option<i64> = None;
            for state in ["waiting", "ready"] {
                let at: Option<i64> = conn.query_row(
                    "SELECT MIN(visible_at_ms) FROM queued_tasks WHERE lane_state = ?1",
                    params![state],
                    |row| row.get(0),
                )?;
                next = next.into_iter().chain(at).min();
            }
            next.map(from_millis).transpose()
        })
        .await
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.with_conn(|conn| {
            let (total, in_flight): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(leased_until_ms IS NOT NULL), 0) FROM queued_tasks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let dead: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
            Ok(QueueStats {
                pending: (total - in_flight) as usize,
                in_flight: in_flight as usize,
                dead_lettered: dead as usize,
            })
        })
        .await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, identity, attempts, enqueued_at_ms, buried_at_ms, reason, detail
                 FROM dead_letters ORDER BY seq",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DeadLetterRow {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        identity: row.get(2)?,
                        attempts: row.get(3)?,
                        enqueued_at_ms: row.get(4)?,
                        buried_at_ms: row.get(5)?,
                        reason: row.get(6)?,
                        detail: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(DeadLetterRow::into_entry).collect()
        })
        .await
    }
}

impl SqliteStore {
    /// Every queued task in delivery order, leased or not
    pub async fn pending_tasks(&self) -> Result<Vec<QueuedTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM queued_tasks ORDER BY enqueued_at_ms, seq",
                TaskRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }
}
