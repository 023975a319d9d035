mod storage;
mod sqlite;
mod remote;
mod config;

pub use storage::TaskStorage;
pub use sqlite::SqliteTaskStore;
pub use remote::{
    FieldGuard, KeyValueStore, KvOp, MemoryKeyValueStore, RedisConnection, RedisTaskStore,
    WriteBatch,
};
pub use config::{open_storage, StorageConfig, DEFAULT_REDIS_NAMESPACE};

use task_queue_core::TaskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    TaskError(#[from] TaskError),

    #[error("Corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Gave up on task {0} after repeated concurrent modifications")]
    Contention(String),
}

impl PersistenceError {
    pub fn not_found(task_id: &str) -> Self {
        PersistenceError::TaskError(TaskError::NotFound(task_id.to_string()))
    }

    pub fn corrupted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PersistenceError::Corrupted {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<PersistenceError> for TaskError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::TaskError(e) => e,
            PersistenceError::SqliteError(e) => TaskError::Unavailable(e.to_string()),
            PersistenceError::RedisError(e) => TaskError::Unavailable(e.to_string()),
            PersistenceError::IoError(e) => TaskError::Unavailable(e.to_string()),
            PersistenceError::Contention(id) => {
                TaskError::Unavailable(format!("task {} is under contention", id))
            }
            PersistenceError::SerializationError(e) => TaskError::Corrupted(e.to_string()),
            err @ PersistenceError::Corrupted { .. } => TaskError::Corrupted(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
