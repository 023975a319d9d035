//! Drives the TCP endpoint with the async client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use task_queue_broker::{MemoryAuditLog, MemoryMetrics, QueueSettings, TaskQueueServer, TaskQueueService};
use task_queue_client::{ClientError, TaskQueueAsyncClient};
use task_queue_core::{Metadata, TaskStatus};
use task_queue_persistence::{SqliteTaskStore, TaskStorage};

struct Running {
    client: TaskQueueAsyncClient,
    service: Arc<TaskQueueService>,
    server: Arc<TaskQueueServer>,
    metrics: Arc<MemoryMetrics>,
    audit: Arc<MemoryAuditLog>,
}

async fn start(settings: QueueSettings) -> Running {
    let storage: Arc<dyn TaskStorage> = Arc::new(SqliteTaskStore::in_memory().unwrap());
    let metrics = Arc::new(MemoryMetrics::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let service = Arc::new(
        TaskQueueService::new(storage)
            .with_metrics(metrics.clone())
            .with_audit(audit.clone())
            .with_settings(settings),
    );

    let server = Arc::new(TaskQueueServer::bind(service.clone(), "127.0.0.1:0").await.unwrap());
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.clone().run());

    let client = TaskQueueAsyncClient::connect(addr.to_string())
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(5));

    Running {
        client,
        service,
        server,
        metrics,
        audit,
    }
}

#[tokio::test]
async fn test_lease_recover_complete_over_tcp() {
    let running = start(QueueSettings {
        visibility_timeout_ms: -1,
        max_attempts: 3,
    })
    .await;
    let client = &running.client;

    let a = client.enqueue("demo", "x", Metadata::new()).await.unwrap();
    assert_eq!(a.status, TaskStatus::Pending);

    let first = client.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(first.id, a.id);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.worker_id.as_deref(), Some("worker-1"));

    let report = running.service.recover_overdue().unwrap();
    assert_eq!(report.requeued.len(), 1);
    let pending = client.list_tasks(Some(TaskStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].worker_id.is_none());

    let second = client.dequeue("worker-2").await.unwrap().unwrap();
    assert_eq!(second.id, a.id);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.worker_id.as_deref(), Some("worker-2"));

    let done = client.ack(&a.id, true, Some("done".to_string())).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let completed = client.list_tasks(Some(TaskStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, a.id);
    assert_eq!(completed[0].result.as_deref(), Some("done"));

    assert_eq!(running.metrics.get("tasks_retried"), 1);
    assert_eq!(running.metrics.get("tasks_dispatched"), 2);
    assert_eq!(running.audit.events_of("task_requeued").len(), 1);

    running.server.shutdown();
}

#[tokio::test]
async fn test_heartbeat_keeps_lease() {
    let running = start(QueueSettings {
        visibility_timeout_ms: 60_000,
        max_attempts: 3,
    })
    .await;
    let client = &running.client;

    let task = client.enqueue("demo", "long job", Metadata::new()).await.unwrap();
    let leased = client.dequeue("worker-1").await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let beat = client.heartbeat(&task.id).await.unwrap();
    assert_eq!(beat.status, TaskStatus::InProgress);
    assert!(beat.updated_at > leased.updated_at);

    assert!(client.dequeue("worker-2").await.unwrap().is_none());

    let err = client.heartbeat("missing").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));

    running.server.shutdown();
}

#[tokio::test]
async fn test_rpc_errors() {
    let running = start(QueueSettings::default()).await;
    let client = &running.client;

    let err = client.ack("missing", true, None).await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));

    let err = client.enqueue("", "x", Metadata::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));

    let err = client.dequeue("").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));

    let task = client.enqueue("demo", "x", Metadata::new()).await.unwrap();
    client.ack(&task.id, false, Some("boom".to_string())).await.unwrap();
    let err = client.ack(&task.id, true, None).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));

    let stored = client.list_tasks(Some(TaskStatus::Failed)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].result.as_deref(), Some("boom"));

    running.server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_lease_each_task_once() {
    let running = start(QueueSettings::default()).await;

    for i in 0..30 {
        running
            .client
            .enqueue("demo", &i.to_string(), Metadata::new())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let client = running.client.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{}", w);
            let mut leased = Vec::new();
            while let Some(task) = client.dequeue(&worker).await.unwrap() {
                leased.push(task.id);
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "task leased twice");
        }
    }
    assert_eq!(seen.len(), 30);

    running.server.shutdown();
}
