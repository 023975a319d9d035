use crate::{PersistenceError, Result, TaskStorage};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use task_queue_core::{now_millis, Metadata, RecoveryReport, TaskRecord, TaskStatus};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    result TEXT,
    worker_id TEXT,
    attempts INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_order ON tasks (status, created_at, id);
";

const SELECT_COLUMNS: &str =
    "SELECT id, type, payload, metadata, status, created_at, updated_at, result, worker_id, attempts FROM tasks";

/// Embedded task store backed by a single SQLite connection.
///
/// The connection sits behind a mutex and every read-modify-write runs in an
/// IMMEDIATE transaction, so callers on different threads (or other processes
/// sharing the file) never lease the same row twice.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteTaskStore {
    /// Open or create a store at `path`; `":memory:"` opens a private in-memory database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let location = path.as_ref().display().to_string();
        let conn = Connection::open(path.as_ref())?;
        Self::bootstrap(conn, location)
    }

    /// Open a private in-memory store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, ":memory:".to_string())
    }

    fn bootstrap(conn: Connection, location: String) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        if location != ":memory:" {
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        }
        conn.execute_batch(SCHEMA)?;

        info!("Opened SQLite task store at {}", location);

        Ok(SqliteTaskStore {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// Database location this store was opened with
    pub fn location(&self) -> &str {
        &self.location
    }

    fn fetch(tx: &Transaction<'_>, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = tx
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![task_id],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_record).transpose()
    }

    /// Write back every mutable column of `record`
    fn save(tx: &Transaction<'_>, record: &TaskRecord) -> Result<()> {
        tx.execute(
            "UPDATE tasks
             SET status = ?1, updated_at = ?2, result = ?3, worker_id = ?4, attempts = ?5
             WHERE id = ?6",
            params![
                record.status.as_str(),
                record.updated_at,
                record.result,
                record.worker_id,
                record.attempts,
                record.id,
            ],
        )?;
        Ok(())
    }

    fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
        Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

impl TaskStorage for SqliteTaskStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord> {
        let record = TaskRecord::new(task_type, payload, metadata)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (id, type, payload, metadata, status, created_at, updated_at, result, worker_id, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.task_type,
                record.payload,
                metadata_json,
                record.status.as_str(),
                record.created_at,
                record.updated_at,
                record.result,
                record.worker_id,
                record.attempts,
            ],
        )?;

        debug!(task_id = %record.id, task_type = %record.task_type, "Persisted new task");
        Ok(record)
    }

    fn dequeue(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn.lock();
        let tx = Self::begin(&mut conn)?;

        // Undecodable rows stay where they are and are passed over
        let next = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE status = 'PENDING' ORDER BY created_at ASC, id ASC",
                SELECT_COLUMNS
            ))?;
            let mut rows = stmt.query([])?;
            let mut next = None;
            while let Some(row) = rows.next()? {
                let row = TaskRow::read(row)?;
                let row_id = row.id.clone();
                match row.into_record() {
                    Ok(record) => {
                        next = Some(record);
                        break;
                    }
                    Err(e) => warn!(task_id = %row_id, "Skipping undecodable pending task: {}", e),
                }
            }
            next
        };

        let Some(mut record) = next else {
            return Ok(None);
        };

        record.claim(worker_id, now_millis());
        Self::save(&tx, &record)?;
        tx.commit()?;

        debug!(task_id = %record.id, worker_id, attempts = record.attempts, "Leased task");
        Ok(Some(record))
    }

    fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord> {
        let mut conn = self.conn.lock();
        let tx = Self::begin(&mut conn)?;

        let mut record =
            Self::fetch(&tx, task_id)?.ok_or_else(|| PersistenceError::not_found(task_id))?;
        record.finish(success, result, now_millis())?;
        Self::save(&tx, &record)?;
        tx.commit()?;

        debug!(task_id, status = %record.status, "Acknowledged task");
        Ok(record)
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();

        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str()], TaskRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY created_at ASC, id ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], TaskRow::read)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(TaskRow::into_record).collect()
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let record = Self::fetch(&tx, task_id)?;
        tx.commit()?;
        Ok(record)
    }

    fn heartbeat(&self, task_id: &str) -> Result<TaskRecord> {
        let mut conn = self.conn.lock();
        let tx = Self::begin(&mut conn)?;

        let mut record =
            Self::fetch(&tx, task_id)?.ok_or_else(|| PersistenceError::not_found(task_id))?;
        record.touch(now_millis());
        Self::save(&tx, &record)?;
        tx.commit()?;

        debug!(task_id, "Heartbeat refreshed task");
        Ok(record)
    }

    fn recover_overdue_tasks(&self, max_age_ms: i64, max_attempts: u32) -> Result<RecoveryReport> {
        let now = now_millis();
        let threshold = now.saturating_sub(max_age_ms);

        let mut conn = self.conn.lock();
        let tx = Self::begin(&mut conn)?;

        let rows = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE status = 'IN_PROGRESS' AND updated_at < ?1 ORDER BY created_at ASC, id ASC",
                SELECT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![threshold], TaskRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut report = RecoveryReport::default();
        for row in rows {
            let row_id = row.id.clone();
            let mut record = match row.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(task_id = %row_id, "Skipping undecodable overdue task: {}", e);
                    continue;
                }
            };

            report.record_owner(&record.id, record.worker_id.clone());
            if record.attempts_exhausted(max_attempts) {
                record.exhaust(now);
                Self::save(&tx, &record)?;
                report.failed.push(record);
            } else {
                record.requeue(now);
                Self::save(&tx, &record)?;
                report.requeued.push(record);
            }
        }
        tx.commit()?;

        if !report.is_empty() {
            debug!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Recovered overdue tasks"
            );
        }
        Ok(report)
    }
}

/// Raw column values, decoded into a `TaskRecord` outside the row callback
struct TaskRow {
    id: String,
    task_type: String,
    payload: String,
    metadata: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    result: Option<String>,
    worker_id: Option<String>,
    attempts: u32,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TaskRow {
            id: row.get(0)?,
            task_type: row.get(1)?,
            payload: row.get(2)?,
            metadata: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            result: row.get(7)?,
            worker_id: row.get(8)?,
            attempts: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| PersistenceError::corrupted(&self.id, e.to_string()))?;
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|_| PersistenceError::corrupted(&self.id, format!("unknown status {}", self.status)))?;

        Ok(TaskRecord {
            id: self.id,
            task_type: self.task_type,
            payload: self.payload,
            metadata,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            result: self.result,
            worker_id: self.worker_id,
            attempts: self.attempts,
        })
    }
}
