use crate::{ClientError, Result};
use task_queue_core::{Metadata, TaskRecord, TaskStatus};
use task_queue_protocol::{
    metadata_entries, AckRequest, DequeueRequest, EnqueueRequest, HeartbeatRequest,
    ListTasksRequest, Message, MessageCodec, TaskMessage,
};

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// Async client for the task queue RPCs.
///
/// Each call opens its own connection, so one client can be shared across
/// tasks without locking.
#[derive(Debug, Clone)]
pub struct TaskQueueAsyncClient {
    broker_address: String,
    timeout: Option<Duration>,
}

impl TaskQueueAsyncClient {
    /// Connect to broker
    pub async fn connect(broker_address: impl Into<String>) -> Result<Self> {
        let broker_address = broker_address.into();

        // Test connection
        let _ = TcpStream::connect(&broker_address)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(TaskQueueAsyncClient {
            broker_address,
            timeout: None,
        })
    }

    /// Deadline applied to every subsequent call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: &str,
        metadata: Metadata,
    ) -> Result<TaskRecord> {
        let request = Message::Enqueue(EnqueueRequest {
            task_type: task_type.to_string(),
            payload: payload.to_string(),
            metadata: metadata_entries(&metadata),
        });

        match self.call(request).await? {
            Message::EnqueueResponse(resp) => into_record(resp.task),
            other => Err(unexpected(other)),
        }
    }

    /// Lease the next task; `None` when the queue is empty
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        let request = Message::Dequeue(DequeueRequest {
            worker_id: worker_id.to_string(),
        });

        match self.call(request).await? {
            Message::DequeueResponse(resp) => match (resp.has_task, resp.task) {
                (true, Some(task)) => into_record(task).map(Some),
                (false, _) => Ok(None),
                (true, None) => Err(ClientError::Protocol(
                    "dequeue reported a task but sent none".to_string(),
                )),
            },
            other => Err(unexpected(other)),
        }
    }

    pub async fn ack(
        &self,
        task_id: &str,
        success: bool,
        result: Option<String>,
    ) -> Result<TaskRecord> {
        let request = Message::Ack(AckRequest {
            task_id: task_id.to_string(),
            success,
            result: result.unwrap_or_default(),
        });

        match self.call(request).await? {
            Message::AckResponse(resp) => into_record(resp.task),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let request = Message::ListTasks(ListTasksRequest {
            status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
        });

        match self.call(request).await? {
            Message::ListTasksResponse(resp) => resp.tasks.into_iter().map(into_record).collect(),
            other => Err(unexpected(other)),
        }
    }

    /// Extend the lease on a long-running task
    pub async fn heartbeat(&self, task_id: &str) -> Result<TaskRecord> {
        let request = Message::Heartbeat(HeartbeatRequest {
            task_id: task_id.to_string(),
        });

        match self.call(request).await? {
            Message::HeartbeatResponse(resp) => into_record(resp.task),
            other => Err(unexpected(other)),
        }
    }

    /// Send one request and wait for its response, within the deadline
    async fn call(&self, request: Message) -> Result<Message> {
        let method = request.method_name();
        debug!(method, broker = %self.broker_address, "Sending request");

        let exchange = self.exchange(request);
        let response = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ClientError::Timeout)??,
            None => exchange.await?,
        };

        match response {
            Message::Status(status) => Err(ClientError::from(status)),
            response => Ok(response),
        }
    }

    async fn exchange(&self, request: Message) -> Result<Message> {
        let stream = TcpStream::connect(&self.broker_address)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let mut framed = Framed::new(stream, MessageCodec);
        framed.send(request).await?;

        match framed.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(ClientError::from(e)),
            None => Err(ClientError::Connection("Connection closed".to_string())),
        }
    }
}

fn into_record(message: TaskMessage) -> Result<TaskRecord> {
    TaskRecord::try_from(message).map_err(|e| ClientError::Protocol(e.to_string()))
}

fn unexpected(message: Message) -> ClientError {
    ClientError::Protocol(format!(
        "Unexpected response {:?}",
        message.message_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TaskQueueAsyncClient::connect(addr.to_string()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept connections but never answer
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = TaskQueueAsyncClient::connect(addr.to_string())
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let err = client.dequeue("worker-1").await.unwrap_err();
        assert_eq!(err, ClientError::Timeout);
    }

    #[tokio::test]
    #[ignore] // Requires a running broker at TQ_ADDR
    async fn test_enqueue_against_broker() {
        let addr = std::env::var("TQ_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string());
        let client = TaskQueueAsyncClient::connect(addr).await.unwrap();

        let task = client.enqueue("echo", "test", Metadata::new()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
