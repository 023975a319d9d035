use crate::{RedisConnection, RedisTaskStore, Result, SqliteTaskStore, TaskStorage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Key prefix used when a Redis backend is configured without one
pub const DEFAULT_REDIS_NAMESPACE: &str = "task_queue";

/// Which backend to open, selected by the `backend` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_namespace() -> String {
    DEFAULT_REDIS_NAMESPACE.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: PathBuf::from("./data/tasks.db"),
        }
    }
}

/// Open the configured backend behind the shared storage contract
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn TaskStorage>> {
    match config {
        StorageConfig::Sqlite { path } => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && path.as_os_str() != ":memory:" {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Ok(Arc::new(SqliteTaskStore::open(path)?))
        }
        StorageConfig::Redis { url, namespace } => {
            let connection = RedisConnection::open(url)?;
            Ok(Arc::new(RedisTaskStore::with_namespace(
                connection,
                namespace.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_redis_without_namespace() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"backend": "redis", "url": "redis://localhost:6379/0"}"#)
                .unwrap();
        assert_eq!(
            config,
            StorageConfig::Redis {
                url: "redis://localhost:6379/0".to_string(),
                namespace: "task_queue".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let parsed: std::result::Result<StorageConfig, _> =
            serde_json::from_str(r#"{"backend": "postgres", "url": "x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_open_sqlite_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("tasks.db");

        let storage = open_storage(&StorageConfig::Sqlite { path: path.clone() }).unwrap();
        assert_eq!(storage.backend_name(), "sqlite");
        assert!(path.exists());
    }

    #[test]
    fn test_open_in_memory_sqlite() {
        let storage = open_storage(&StorageConfig::Sqlite {
            path: PathBuf::from(":memory:"),
        })
        .unwrap();
        assert!(storage.list_tasks(None).unwrap().is_empty());
    }
}
