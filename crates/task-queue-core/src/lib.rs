mod task;
mod error;
mod recovery;

pub use task::{
    new_task_id, now_millis, Metadata, TaskId, TaskRecord, TaskStatus, MAX_ATTEMPTS_EXCEEDED,
};
pub use recovery::RecoveryReport;
pub use error::{TaskError, Result};

/// Default lease length before an unacknowledged task is reclaimed.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: i64 = 300_000;

/// Default number of leases a task gets before it is failed permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
