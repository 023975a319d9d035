use crate::service::TaskQueueService;
use task_queue_core::TaskError;
use task_queue_protocol::{
    entries_to_metadata, AckRequest, AckResponse, DequeueRequest, DequeueResponse,
    EnqueueRequest, EnqueueResponse, HeartbeatRequest, HeartbeatResponse, ListTasksRequest,
    ListTasksResponse, Message, MessageCodec, RpcStatus, StatusCode, TaskMessage,
};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::Framed;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// TCP endpoint serving the queue RPCs
pub struct TaskQueueServer {
    service: Arc<TaskQueueService>,
    listener: TcpListener,
    shutdown: Arc<Notify>,
}

impl TaskQueueServer {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind(service: Arc<TaskQueueService>, addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Task queue listening on {}", listener.local_addr()?);

        Ok(TaskQueueServer {
            service,
            listener,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops `run` when notified
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Accept connections until shut down
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let service = self.service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(service, stream).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutting down task queue server");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(service: Arc<TaskQueueService>, stream: TcpStream) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, MessageCodec);

    while let Some(result) = framed.next().await {
        match result {
            Ok(message) => {
                let method = message.method_name();
                let service = service.clone();
                // Storage calls block, keep them off the reactor
                let response = tokio::task::spawn_blocking(move || handle_message(&service, message))
                    .await
                    .unwrap_or_else(|e| {
                        error!(method, "Request handler panicked: {}", e);
                        Message::Status(RpcStatus::new(StatusCode::Internal, "request handler failed"))
                    });
                framed.send(response).await?;
            }
            Err(e) => {
                warn!("Protocol error: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Map one request onto the service and back
pub fn handle_message(service: &TaskQueueService, message: Message) -> Message {
    let method = message.method_name();
    let response = match message {
        Message::Enqueue(req) => handle_enqueue(service, req),
        Message::Dequeue(req) => handle_dequeue(service, req),
        Message::Ack(req) => handle_ack(service, req),
        Message::ListTasks(req) => handle_list_tasks(service, req),
        Message::Heartbeat(req) => handle_heartbeat(service, req),
        other => {
            return Message::Status(RpcStatus::new(
                StatusCode::Unimplemented,
                format!("{:?} is not a request", other.message_type()),
            ))
        }
    };

    response.unwrap_or_else(|e| {
        debug!(method, "Request failed: {}", e);
        Message::Status(RpcStatus::from(&e))
    })
}

fn handle_enqueue(service: &TaskQueueService, req: EnqueueRequest) -> Result<Message, TaskError> {
    let metadata = entries_to_metadata(req.metadata);
    let record = service.enqueue(&req.task_type, &req.payload, metadata)?;
    Ok(Message::EnqueueResponse(EnqueueResponse {
        task: TaskMessage::from(&record),
    }))
}

fn handle_dequeue(service: &TaskQueueService, req: DequeueRequest) -> Result<Message, TaskError> {
    let record = service.dequeue(&req.worker_id)?;
    Ok(Message::DequeueResponse(DequeueResponse {
        has_task: record.is_some(),
        task: record.as_ref().map(TaskMessage::from),
    }))
}

fn handle_ack(service: &TaskQueueService, req: AckRequest) -> Result<Message, TaskError> {
    let result = Some(req.result).filter(|r| !r.is_empty());
    let record = service.ack(&req.task_id, req.success, result)?;
    Ok(Message::AckResponse(AckResponse {
        task: TaskMessage::from(&record),
    }))
}

fn handle_list_tasks(service: &TaskQueueService, req: ListTasksRequest) -> Result<Message, TaskError> {
    let records = service.list_tasks(&req.status)?;
    Ok(Message::ListTasksResponse(ListTasksResponse {
        tasks: records.iter().map(TaskMessage::from).collect(),
    }))
}

fn handle_heartbeat(service: &TaskQueueService, req: HeartbeatRequest) -> Result<Message, TaskError> {
    let record = service.heartbeat(&req.task_id)?;
    Ok(Message::HeartbeatResponse(HeartbeatResponse {
        task: TaskMessage::from(&record),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue_persistence::SqliteTaskStore;
    use task_queue_protocol::MetadataEntry;

    fn service() -> TaskQueueService {
        TaskQueueService::new(Arc::new(SqliteTaskStore::in_memory().unwrap()))
    }

    fn enqueue(service: &TaskQueueService) -> TaskMessage {
        let request = Message::Enqueue(EnqueueRequest {
            task_type: "demo".to_string(),
            payload: "x".to_string(),
            metadata: vec![MetadataEntry {
                key: "k".to_string(),
                value: "v".to_string(),
            }],
        });
        match handle_message(service, request) {
            Message::EnqueueResponse(resp) => resp.task,
            other => panic!("Expected EnqueueResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_and_dequeue_messages() {
        let service = service();
        let task = enqueue(&service);
        assert_eq!(task.status, "PENDING");
        assert_eq!(task.metadata.len(), 1);

        let response = handle_message(
            &service,
            Message::Dequeue(DequeueRequest {
                worker_id: "worker-1".to_string(),
            }),
        );
        match response {
            Message::DequeueResponse(resp) => {
                assert!(resp.has_task);
                let leased = resp.task.unwrap();
                assert_eq!(leased.id, task.id);
                assert_eq!(leased.attempts, 1);
            }
            other => panic!("Expected DequeueResponse, got {:?}", other),
        }

        let empty = handle_message(
            &service,
            Message::Dequeue(DequeueRequest {
                worker_id: "worker-1".to_string(),
            }),
        );
        assert_eq!(
            empty,
            Message::DequeueResponse(DequeueResponse {
                has_task: false,
                task: None
            })
        );
    }

    #[test]
    fn test_empty_result_stored_as_none() {
        let service = service();
        let task = enqueue(&service);

        let response = handle_message(
            &service,
            Message::Ack(AckRequest {
                task_id: task.id,
                success: true,
                result: String::new(),
            }),
        );
        match response {
            Message::AckResponse(resp) => {
                assert_eq!(resp.task.status, "COMPLETED");
                assert!(resp.task.result.is_none());
            }
            other => panic!("Expected AckResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_errors_become_status_codes() {
        let service = service();

        let unknown = handle_message(
            &service,
            Message::Ack(AckRequest {
                task_id: "missing".to_string(),
                success: true,
                result: String::new(),
            }),
        );
        assert!(matches!(unknown, Message::Status(RpcStatus { code: StatusCode::NotFound, .. })));

        let bad_filter = handle_message(
            &service,
            Message::ListTasks(ListTasksRequest {
                status: "DONE".to_string(),
            }),
        );
        assert!(matches!(
            bad_filter,
            Message::Status(RpcStatus { code: StatusCode::InvalidArgument, .. })
        ));

        let task = enqueue(&service);
        let ack = |result: &str| {
            handle_message(
                &service,
                Message::Ack(AckRequest {
                    task_id: task.id.clone(),
                    success: true,
                    result: result.to_string(),
                }),
            )
        };
        assert!(matches!(ack("first"), Message::AckResponse(_)));
        assert!(matches!(
            ack("second"),
            Message::Status(RpcStatus { code: StatusCode::FailedPrecondition, .. })
        ));
    }

    #[test]
    fn test_response_as_request_is_unimplemented() {
        let service = service();
        let response = handle_message(
            &service,
            Message::ListTasksResponse(ListTasksResponse { tasks: vec![] }),
        );
        assert!(matches!(
            response,
            Message::Status(RpcStatus { code: StatusCode::Unimplemented, .. })
        ));
    }
}
