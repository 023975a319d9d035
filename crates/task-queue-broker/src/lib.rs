pub mod audit;
pub mod config;
pub mod metrics;
pub mod server;
pub mod service;

pub use audit::{AuditError, AuditEvent, AuditSink, MemoryAuditLog, SqliteAuditStore};
pub use config::BrokerConfig;
pub use metrics::{MemoryMetrics, MetricsSink, QueueMetrics};
pub use server::TaskQueueServer;
pub use service::{QueueSettings, TaskQueueService};
