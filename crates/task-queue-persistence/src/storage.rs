use crate::Result;
use task_queue_core::{Metadata, RecoveryReport, TaskRecord, TaskStatus};

/// Persistence contract shared by every queue backend.
///
/// Implementations must give identical observable results for the same
/// sequence of calls, and must stay correct when called from many threads at
/// once: no two concurrent `dequeue` calls may lease the same task.
pub trait TaskStorage: Send + Sync {
    /// Short name used in logs
    fn backend_name(&self) -> &'static str;

    /// Persist a new PENDING task and return it
    fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord>;

    /// Lease the oldest PENDING task (by `created_at`, then id) to `worker_id`
    fn dequeue(&self, worker_id: &str) -> Result<Option<TaskRecord>>;

    /// Finalize a task as COMPLETED or FAILED
    fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord>;

    /// All tasks ordered by `created_at`, optionally filtered by status
    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>>;

    /// Look up a single task
    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Refresh `updated_at` so a long-running lease is not reclaimed
    fn heartbeat(&self, task_id: &str) -> Result<TaskRecord>;

    /// Requeue or fail IN_PROGRESS tasks not updated within `max_age_ms`
    fn recover_overdue_tasks(&self, max_age_ms: i64, max_attempts: u32) -> Result<RecoveryReport>;
}
