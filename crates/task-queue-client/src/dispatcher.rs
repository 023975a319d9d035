use crate::envelope::TaskEnvelope;
use crate::transport::{DispatchTransport, EmbeddedTransport, RemoteTransport};
use crate::{Result, TaskQueueAsyncClient};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use task_queue_core::{TaskId, TaskRecord, TaskStatus};
use task_queue_persistence::{SqliteTaskStore, TaskStorage};
use tracing::info;

/// Task type used for every dispatched orchestration task
pub const ORCHESTRATION_TASK_TYPE: &str = "orchestration";

/// Caller-facing view of a queued orchestration task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedTask {
    pub id: TaskId,
    pub envelope: TaskEnvelope,
    pub status: TaskStatus,
    pub attempts: u32,
}

impl DispatchedTask {
    pub fn agent(&self) -> &str {
        self.envelope.agent()
    }

    pub fn action(&self) -> &str {
        self.envelope.action()
    }

    pub fn payload(&self) -> Map<String, Value> {
        self.envelope.payload()
    }

    /// Flat `{id, agent, action, payload, status, attempts}` object
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "agent": self.agent(),
            "action": self.action(),
            "payload": self.payload(),
            "status": self.status,
            "attempts": self.attempts,
        })
    }
}

impl From<&TaskRecord> for DispatchedTask {
    fn from(record: &TaskRecord) -> Self {
        DispatchedTask {
            id: record.id.clone(),
            envelope: TaskEnvelope::decode(&record.payload, &record.metadata),
            status: record.status,
            attempts: record.attempts,
        }
    }
}

/// Submits orchestration work to a queue, remote or in-process
pub struct Dispatcher {
    transport: Box<dyn DispatchTransport>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn DispatchTransport>) -> Self {
        Dispatcher { transport }
    }

    /// Dispatch through a broker at `address`
    pub async fn connect(address: impl Into<String>) -> Result<Self> {
        let client = TaskQueueAsyncClient::connect(address).await?;
        info!("Dispatching to broker at {}", client.broker_address());
        Ok(Self::remote(client))
    }

    pub fn remote(client: TaskQueueAsyncClient) -> Self {
        Self::new(Box::new(RemoteTransport::new(client)))
    }

    /// Dispatch straight into a storage backend owned by this process
    pub fn embedded(storage: Arc<dyn TaskStorage>) -> Self {
        Self::new(Box::new(EmbeddedTransport::new(storage)))
    }

    /// Embedded dispatch over a SQLite file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = SqliteTaskStore::open(path)?;
        Ok(Self::embedded(Arc::new(storage)))
    }

    /// Embedded dispatch over a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let storage = SqliteTaskStore::in_memory()?;
        Ok(Self::embedded(Arc::new(storage)))
    }

    pub async fn run_task(
        &self,
        agent: &str,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<DispatchedTask> {
        let envelope = TaskEnvelope::new(agent, action, payload);
        let record = self
            .transport
            .enqueue(ORCHESTRATION_TASK_TYPE, &envelope.encode(), envelope.metadata())
            .await?;
        Ok(DispatchedTask::from(&record))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<DispatchedTask>> {
        let records = self.transport.list(status).await?;
        Ok(records.iter().map(DispatchedTask::from).collect())
    }

    pub async fn acknowledge(
        &self,
        task_id: &str,
        success: bool,
        result: Option<String>,
    ) -> Result<DispatchedTask> {
        let record = self.transport.ack(task_id, success, result).await?;
        Ok(DispatchedTask::from(&record))
    }
}
