use crate::{TaskError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = String;

/// Producer-supplied tags, kept in key order
pub type Metadata = BTreeMap<String, String>;

/// Result stored on tasks that were failed by the recovery sweep
pub const MAX_ATTEMPTS_EXCEEDED: &str = "maximum attempts exceeded";

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a fresh task id.
///
/// UUIDv7 ids from one process sort in creation order, so they double as the
/// FIFO tie-break for tasks created within the same millisecond.
pub fn new_task_id() -> TaskId {
    Uuid::now_v7().to_string()
}

/// Task status in the queue system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is waiting to be leased by a worker
    Pending,
    /// Task is leased by a worker
    InProgress,
    /// Task was acknowledged successfully
    Completed,
    /// Task was acknowledged as failed or ran out of attempts
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(TaskError::InvalidArgument(format!(
                "unsupported status '{}'",
                other
            ))),
        }
    }
}

/// One persisted task.
///
/// Backends never mutate fields directly; every state change goes through the
/// transition methods below so both storage implementations agree on the
/// resulting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Assigned at enqueue, never changes
    pub id: TaskId,

    /// Producer-defined category
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque payload, encoding chosen by the producer
    pub payload: String,

    pub metadata: Metadata,

    pub status: TaskStatus,

    /// Epoch milliseconds
    pub created_at: i64,

    /// Epoch milliseconds, refreshed on every mutation and heartbeat
    pub updated_at: i64,

    /// Set on acknowledgement
    pub result: Option<String>,

    /// Lease owner, present iff the task is IN_PROGRESS
    pub worker_id: Option<String>,

    /// Number of times the task has been leased
    pub attempts: u32,
}

impl TaskRecord {
    /// Create a new PENDING task
    pub fn new(
        task_type: impl Into<String>,
        payload: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Self> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(TaskError::InvalidArgument(
                "task type must not be empty".to_string(),
            ));
        }

        let now = now_millis();
        Ok(TaskRecord {
            id: new_task_id(),
            task_type,
            payload: payload.into(),
            metadata,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            worker_id: None,
            attempts: 0,
        })
    }

    /// Lease the task to a worker
    pub fn claim(&mut self, worker_id: &str, now: i64) {
        self.status = TaskStatus::InProgress;
        self.worker_id = Some(worker_id.to_string());
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Finalize the task as COMPLETED or FAILED.
    ///
    /// Terminal tasks are rejected and left untouched.
    pub fn finish(&mut self, success: bool, result: Option<String>, now: i64) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TaskError::InvalidState {
                task_id: self.id.clone(),
                status: self.status,
            });
        }

        self.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.result = result.filter(|r| !r.is_empty());
        self.worker_id = None;
        self.updated_at = now;
        Ok(())
    }

    /// Return an expired lease to the queue; attempts are kept
    pub fn requeue(&mut self, now: i64) {
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.updated_at = now;
    }

    /// Fail a task whose lease expired after its last allowed attempt
    pub fn exhaust(&mut self, now: i64) {
        self.status = TaskStatus::Failed;
        self.result = Some(MAX_ATTEMPTS_EXCEEDED.to_string());
        self.worker_id = None;
        self.updated_at = now;
    }

    /// Refresh `updated_at` without changing status
    pub fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }

    /// Whether the lease counts as expired for a sweep with this cutoff
    pub fn is_overdue(&self, threshold: i64) -> bool {
        self.status == TaskStatus::InProgress && self.updated_at < threshold
    }

    /// Whether an expired lease should fail instead of requeue
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> TaskRecord {
        TaskRecord::new("demo", "x", Metadata::new()).unwrap()
    }

    #[test]
    fn test_task_creation() {
        let mut metadata = Metadata::new();
        metadata.insert("priority".to_string(), "high".to_string());
        let task = TaskRecord::new("demo", "payload", metadata.clone()).unwrap();

        assert_eq!(task.task_type, "demo");
        assert_eq!(task.payload, "payload");
        assert_eq!(task.metadata, metadata);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.created_at, task.updated_at);
        assert!(task.worker_id.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_empty_type_rejected() {
        match TaskRecord::new("  ", "x", Metadata::new()) {
            Err(TaskError::InvalidArgument(_)) => {}
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_ids_follow_creation_order() {
        let ids: Vec<TaskId> = (0..200).map(|_| new_task_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_status_parsing() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TaskStatus>().is_err());
        assert!("".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_display_matches_wire_string() {
        assert_eq!(TaskStatus::InProgress.to_string(), "IN_PROGRESS");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_claim_sets_lease() {
        let mut task = record();
        task.claim("worker-1", task.created_at + 5);

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(task.attempts, 1);
        assert_eq!(task.updated_at, task.created_at + 5);
    }

    #[test]
    fn test_finish_clears_lease() {
        let mut task = record();
        task.claim("worker-1", 10);
        task.finish(true, Some("done".to_string()), 20).unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.worker_id.is_none());
        assert_eq!(task.updated_at, 20);
    }

    #[test]
    fn test_finish_rejects_terminal() {
        let mut task = record();
        task.finish(false, Some("boom".to_string()), 10).unwrap();
        let before = task.clone();

        match task.finish(true, Some("late".to_string()), 20) {
            Err(TaskError::InvalidState { status, .. }) => assert_eq!(status, TaskStatus::Failed),
            other => panic!("Expected InvalidState, got {:?}", other),
        }
        assert_eq!(task, before);
    }

    #[test]
    fn test_empty_result_is_none() {
        let mut task = record();
        task.finish(true, Some(String::new()), 10).unwrap();
        assert!(task.result.is_none());
    }

    #[test]
    fn test_exhaust_marks_failed() {
        let mut task = record();
        task.claim("worker-1", 10);
        task.exhaust(20);

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_deref(), Some(MAX_ATTEMPTS_EXCEEDED));
        assert!(task.worker_id.is_none());
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn test_overdue_only_in_progress() {
        let mut task = record();
        assert!(!task.is_overdue(i64::MAX));
        task.claim("worker-1", 100);
        assert!(task.is_overdue(101));
        assert!(!task.is_overdue(100));
    }

    proptest! {
        #[test]
        fn attempts_count_leases(requeues in 0usize..20) {
            let mut task = record();
            for lease in 1..=requeues + 1 {
                task.claim("worker", lease as i64);
                prop_assert_eq!(task.attempts as usize, lease);
                prop_assert!(task.worker_id.is_some());
                task.requeue(lease as i64);
                prop_assert!(task.worker_id.is_none());
                prop_assert_eq!(task.attempts as usize, lease);
            }
        }
    }
}
