use crate::audit::{self, AuditDetails, AuditSink};
use crate::metrics::{self, MetricsSink};
use std::sync::Arc;
use task_queue_core::{
    Metadata, RecoveryReport, Result, TaskError, TaskRecord, TaskStatus,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_VISIBILITY_TIMEOUT_MS,
};
use task_queue_persistence::TaskStorage;
use tracing::{error, info, warn};

/// Lease parameters fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Age after which an unacknowledged lease is reclaimed
    pub visibility_timeout_ms: i64,
    /// Leases allowed before an expired task is failed instead of requeued
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Queue operations over a storage backend, plus the lazy visibility-timeout
/// sweep, counters and audit trail.
///
/// Holds no queue state of its own; all of it lives in the backend, so one
/// service can be shared freely across threads.
pub struct TaskQueueService {
    storage: Arc<dyn TaskStorage>,
    metrics: Option<Arc<dyn MetricsSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    settings: QueueSettings,
}

impl TaskQueueService {
    pub fn new(storage: Arc<dyn TaskStorage>) -> Self {
        TaskQueueService {
            storage,
            metrics: None,
            audit: None,
            settings: QueueSettings::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    pub fn storage(&self) -> Arc<dyn TaskStorage> {
        Arc::clone(&self.storage)
    }

    pub fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord> {
        let record = self.storage.enqueue(task_type, payload, metadata)?;

        info!(task_id = %record.id, task_type = %record.task_type, "Task enqueued");
        self.count(metrics::TASKS_ENQUEUED, 1);
        self.audit(audit::TASK_ENQUEUED, "queue", task_details(&record));
        Ok(record)
    }

    /// Sweep expired leases, then lease the oldest PENDING task
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        if worker_id.trim().is_empty() {
            return Err(TaskError::InvalidArgument(
                "worker_id must not be empty".to_string(),
            ));
        }

        self.recover_overdue()?;

        let Some(record) = self.storage.dequeue(worker_id)? else {
            return Ok(None);
        };

        info!(task_id = %record.id, worker_id, attempts = record.attempts, "Task dispatched");
        self.count(metrics::TASKS_DISPATCHED, 1);
        self.audit(audit::TASK_DEQUEUED, worker_id, task_details(&record));
        Ok(Some(record))
    }

    pub fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord> {
        let record = self.storage.ack(task_id, success, result)?;

        info!(
            task_id = %record.id,
            status = %record.status,
            result = ?record.result,
            "Task acknowledged"
        );
        let counter = if success {
            metrics::TASKS_COMPLETED
        } else {
            metrics::TASKS_FAILED
        };
        self.count(counter, 1);
        self.audit(audit::TASK_ACKNOWLEDGED, "queue", status_details(&record));
        Ok(record)
    }

    /// List tasks; an empty filter means every status
    pub fn list_tasks(&self, status: &str) -> Result<Vec<TaskRecord>> {
        let filter = if status.is_empty() {
            None
        } else {
            Some(status.parse::<TaskStatus>()?)
        };
        Ok(self.storage.list_tasks(filter)?)
    }

    pub fn get_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.storage
            .get_task(task_id)?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    pub fn heartbeat(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.storage.heartbeat(task_id)?;
        self.audit(audit::TASK_HEARTBEAT, "queue", task_details(&record));
        Ok(record)
    }

    /// Run the visibility-timeout sweep now
    pub fn recover_overdue(&self) -> Result<RecoveryReport> {
        let report = self.storage.recover_overdue_tasks(
            self.settings.visibility_timeout_ms,
            self.settings.max_attempts,
        )?;

        if !report.requeued.is_empty() {
            self.count(metrics::TASKS_RETRIED, report.requeued.len() as u64);
            for record in &report.requeued {
                warn!(task_id = %record.id, attempts = record.attempts, "Requeued stale task");
                self.audit(audit::TASK_REQUEUED, "queue", attempt_details(record));
            }
        }

        if !report.failed.is_empty() {
            self.count(metrics::TASKS_FAILED_TIMEOUT, report.failed.len() as u64);
            for record in &report.failed {
                error!(
                    task_id = %record.id,
                    attempts = record.attempts,
                    "Task marked as failed after exceeding attempts"
                );
                let subject = report.previous_worker(&record.id).unwrap_or("unknown");
                self.audit(audit::TASK_FAILED_TIMEOUT, subject, attempt_details(record));
            }
        }

        Ok(report)
    }

    fn count(&self, name: &str, amount: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment(name, amount);
        }
    }

    fn audit(&self, event_type: &str, subject: &str, details: AuditDetails) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_event(event_type, subject, details) {
                warn!(event_type, subject, "Failed to record audit event: {}", e);
            }
        }
    }
}

fn task_details(record: &TaskRecord) -> AuditDetails {
    let mut details = AuditDetails::new();
    details.insert("task_id".to_string(), record.id.clone());
    details
}

fn status_details(record: &TaskRecord) -> AuditDetails {
    let mut details = task_details(record);
    details.insert("status".to_string(), record.status.to_string());
    details
}

fn attempt_details(record: &TaskRecord) -> AuditDetails {
    let mut details = task_details(record);
    details.insert("attempts".to_string(), record.attempts.to_string());
    details
}
