use crate::service::QueueSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use task_queue_core::{DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT_MS};
use task_queue_persistence::StorageConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: NetworkConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub audit: AuditConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_ms: i64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 50051,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            enabled: false,
            path: PathBuf::from("./data/audit.db"),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            server: NetworkConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            audit: AuditConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout_ms: self.queue.visibility_timeout_ms,
            max_attempts: self.queue.max_attempts,
        }
    }
}
