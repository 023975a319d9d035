use crate::{ClientError, Result, TaskQueueAsyncClient};
use async_trait::async_trait;
use std::sync::Arc;
use task_queue_core::{Metadata, TaskRecord, TaskStatus};
use task_queue_persistence::TaskStorage;

/// The queue calls a `Dispatcher` needs, wherever the queue lives
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord>;

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>>;

    async fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord>;
}

/// Calls a broker over the network
pub struct RemoteTransport {
    client: TaskQueueAsyncClient,
}

impl RemoteTransport {
    pub fn new(client: TaskQueueAsyncClient) -> Self {
        RemoteTransport { client }
    }
}

#[async_trait]
impl DispatchTransport for RemoteTransport {
    async fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord> {
        self.client.enqueue(task_type, payload, metadata).await
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.client.list_tasks(status).await
    }

    async fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord> {
        self.client.ack(task_id, success, result).await
    }
}

/// Owns a storage backend in-process
pub struct EmbeddedTransport {
    storage: Arc<dyn TaskStorage>,
}

impl EmbeddedTransport {
    pub fn new(storage: Arc<dyn TaskStorage>) -> Self {
        EmbeddedTransport { storage }
    }

    pub fn storage(&self) -> Arc<dyn TaskStorage> {
        Arc::clone(&self.storage)
    }

    /// Run a blocking storage call off the async executor
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TaskStorage) -> task_queue_persistence::Result<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || call(storage.as_ref()))
            .await
            .map_err(|e| ClientError::Server(e.to_string()))?
            .map_err(ClientError::from)
    }
}

#[async_trait]
impl DispatchTransport for EmbeddedTransport {
    async fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord> {
        let task_type = task_type.to_string();
        let payload = payload.to_string();
        self.blocking(move |storage| storage.enqueue(&task_type, &payload, metadata))
            .await
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.blocking(move |storage| storage.list_tasks(status)).await
    }

    async fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord> {
        let task_id = task_id.to_string();
        let result = result.filter(|r| !r.is_empty());
        self.blocking(move |storage| storage.ack(&task_id, success, result))
            .await
    }
}
