//! Write-only audit trail of queue actions.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use task_queue_core::now_millis;
use thiserror::Error;
use tracing::info;

pub const TASK_ENQUEUED: &str = "task_enqueued";
pub const TASK_DEQUEUED: &str = "task_dequeued";
pub const TASK_ACKNOWLEDGED: &str = "task_acknowledged";
pub const TASK_REQUEUED: &str = "task_requeued";
pub const TASK_FAILED_TIMEOUT: &str = "task_failed_timeout";
pub const TASK_HEARTBEAT: &str = "task_heartbeat";

pub type AuditDetails = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub subject: String,
    pub details: AuditDetails,
    /// Epoch milliseconds
    pub created_at: i64,
}

impl AuditEvent {
    pub fn new(event_type: &str, subject: &str, details: AuditDetails) -> Self {
        AuditEvent {
            event_type: event_type.to_string(),
            subject: subject.to_string(),
            details,
            created_at: now_millis(),
        }
    }
}

/// Receiver of audit events
pub trait AuditSink: Send + Sync {
    fn record_event(
        &self,
        event_type: &str,
        subject: &str,
        details: AuditDetails,
    ) -> Result<AuditEvent, AuditError>;
}

/// Audit events persisted to an `audit_events` SQLite table
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                subject TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )?;

        Ok(SqliteAuditStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::open(":memory:")
    }

    /// Most recent events first
    pub fn list_events(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_type, subject, details, created_at FROM audit_events
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(event_type, subject, details, created_at)| {
                Ok(AuditEvent {
                    event_type,
                    subject,
                    details: serde_json::from_str(&details)?,
                    created_at,
                })
            })
            .collect()
    }
}

impl AuditSink for SqliteAuditStore {
    fn record_event(
        &self,
        event_type: &str,
        subject: &str,
        details: AuditDetails,
    ) -> Result<AuditEvent, AuditError> {
        let event = AuditEvent::new(event_type, subject, details);
        let details_json = serde_json::to_string(&event.details)?;

        self.conn.lock().execute(
            "INSERT INTO audit_events (event_type, subject, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.event_type, event.subject, details_json, event.created_at],
        )?;

        info!(event_type, subject, details = ?event.details, "Audit event");
        Ok(event)
    }
}

/// Keeps events in memory, oldest first
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn events_of(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record_event(
        &self,
        event_type: &str,
        subject: &str,
        details: AuditDetails,
    ) -> Result<AuditEvent, AuditError> {
        let event = AuditEvent::new(event_type, subject, details);
        self.events.lock().push(event.clone());
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn details(task_id: &str) -> AuditDetails {
        let mut details = AuditDetails::new();
        details.insert("task_id".to_string(), task_id.to_string());
        details
    }

    #[test]
    fn test_sqlite_store_lists_newest_first() {
        let store = SqliteAuditStore::in_memory().unwrap();
        store.record_event(TASK_ENQUEUED, "queue", details("a")).unwrap();
        store.record_event(TASK_DEQUEUED, "worker-1", details("a")).unwrap();
        store.record_event(TASK_ACKNOWLEDGED, "queue", details("a")).unwrap();

        let events = store.list_events(2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, TASK_ACKNOWLEDGED);
        assert_eq!(events[1].event_type, TASK_DEQUEUED);
        assert_eq!(events[1].subject, "worker-1");
        assert_eq!(events[1].details, details("a"));
    }

    #[test]
    fn test_sqlite_store_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audit.db");

        {
            let store = SqliteAuditStore::open(&path).unwrap();
            store.record_event(TASK_REQUEUED, "queue", details("b")).unwrap();
        }

        let store = SqliteAuditStore::open(&path).unwrap();
        let events = store.list_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TASK_REQUEUED);
    }

    #[test]
    fn test_memory_log_filters_by_type() {
        let log = MemoryAuditLog::new();
        log.record_event(TASK_ENQUEUED, "queue", details("a")).unwrap();
        log.record_event(TASK_ENQUEUED, "queue", details("b")).unwrap();
        log.record_event(TASK_HEARTBEAT, "queue", details("a")).unwrap();

        assert_eq!(log.events().len(), 3);
        assert_eq!(log.events_of(TASK_ENQUEUED).len(), 2);
        assert!(log.events_of(TASK_FAILED_TIMEOUT).is_empty());
    }
}
