use crate::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task {task_id} is already {status}")]
    InvalidState { task_id: String, status: TaskStatus },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupted task data: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;
