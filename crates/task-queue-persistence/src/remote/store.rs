use super::{KeyValueStore, WriteBatch};
use crate::{PersistenceError, Result, TaskStorage};
use std::collections::HashMap;
use task_queue_core::{now_millis, Metadata, RecoveryReport, TaskRecord, TaskStatus};
use tracing::{debug, warn};

/// Attempts at a guarded write before giving up with `Contention`
const MAX_COMMIT_RETRIES: usize = 16;

/// Task store laid out over Redis data structures.
///
/// Keys, all under `namespace`:
/// - `{ns}:task:{id}` hash holding the record
/// - `{ns}:pending` sorted set of PENDING ids scored by `created_at`
/// - `{ns}:in_progress` sorted set of leased ids scored by `updated_at`
/// - `{ns}:all` and `{ns}:status:{status}` id sets for listing
///
/// Every state change is a guarded batch on the task's `status` and
/// `updated_at` fields, so a writer that raced another one sees its batch
/// rejected and re-reads instead of overwriting.
pub struct RedisTaskStore<K: KeyValueStore> {
    kv: K,
    namespace: String,
}

impl<K: KeyValueStore> RedisTaskStore<K> {
    pub fn new(kv: K) -> Self {
        Self::with_namespace(kv, crate::DEFAULT_REDIS_NAMESPACE)
    }

    pub fn with_namespace(kv: K, namespace: impl Into<String>) -> Self {
        RedisTaskStore {
            kv,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.namespace, task_id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.namespace)
    }

    fn in_progress_key(&self) -> String {
        format!("{}:in_progress", self.namespace)
    }

    fn all_key(&self) -> String {
        format!("{}:all", self.namespace)
    }

    fn status_key(&self, status: TaskStatus) -> String {
        format!(
            "{}:status:{}",
            self.namespace,
            status.as_str().to_ascii_lowercase()
        )
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let key = self.task_key(task_id);
        let fields = self.kv.hash_get_all(&key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(&key, fields).map(Some)
    }

    /// Batch guarded on the fields every transition reads
    fn guarded(&self, record: &TaskRecord) -> WriteBatch {
        let key = self.task_key(&record.id);
        WriteBatch::new()
            .guard(&key, "status", record.status.as_str())
            .guard(&key, "updated_at", &record.updated_at.to_string())
    }

    /// Append the index moves for `before -> after`
    fn transition(&self, batch: WriteBatch, before: TaskStatus, after: &TaskRecord) -> WriteBatch {
        let id = after.id.as_str();
        let mut batch = batch.hash_set(&self.task_key(id), mutable_fields(after));

        if before != after.status {
            batch = batch
                .set_remove(&self.status_key(before), id)
                .set_add(&self.status_key(after.status), id);
        }

        match after.status {
            TaskStatus::Pending => batch
                .sorted_set_remove(&self.in_progress_key(), id)
                .sorted_set_add(&self.pending_key(), id, after.created_at),
            TaskStatus::InProgress => batch
                .sorted_set_remove(&self.pending_key(), id)
                .sorted_set_add(&self.in_progress_key(), id, after.updated_at),
            TaskStatus::Completed | TaskStatus::Failed => batch
                .sorted_set_remove(&self.pending_key(), id)
                .sorted_set_remove(&self.in_progress_key(), id),
        }
    }

    /// Lease a task id this caller popped off the pending queue. Returns
    /// `None` when the entry was stale.
    ///
    /// On any error the id goes back on the pending queue with its original
    /// score before the error is returned, so the task is never stranded.
    fn claim_popped(&self, task_id: &str, score: i64, worker_id: &str) -> Result<Option<TaskRecord>> {
        match self.try_claim(task_id, worker_id) {
            Ok(claimed) => Ok(claimed),
            Err(e) => {
                let restore = WriteBatch::new().sorted_set_add(&self.pending_key(), task_id, score);
                if let Err(restore_err) = self.kv.commit(restore) {
                    warn!(task_id, "Failed to return task to the pending queue: {}", restore_err);
                }
                Err(e)
            }
        }
    }

    fn try_claim(&self, task_id: &str, worker_id: &str) -> Result<Option<TaskRecord>> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let mut record = match self.load(task_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(task_id, "Dropping queue entry for missing task");
                    return Ok(None);
                }
                Err(e @ PersistenceError::Corrupted { .. }) => {
                    warn!(task_id, "Dropping undecodable queued task: {}", e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if record.status != TaskStatus::Pending {
                return Ok(None);
            }

            let batch = self.guarded(&record);
            record.claim(worker_id, now_millis());
            let batch = self.transition(batch, TaskStatus::Pending, &record);

            if self.kv.commit(batch)? {
                return Ok(Some(record));
            }
        }

        Err(PersistenceError::Contention(task_id.to_string()))
    }

    /// Requeue or fail one overdue lease. Returns `None` when the task no
    /// longer qualifies or another writer got there first.
    fn recover_one(
        &self,
        task_id: &str,
        threshold: i64,
        max_attempts: u32,
        now: i64,
    ) -> Result<Option<(TaskRecord, Option<String>)>> {
        let Some(mut record) = self.load(task_id)? else {
            self.kv
                .commit(WriteBatch::new().sorted_set_remove(&self.in_progress_key(), task_id))?;
            return Ok(None);
        };

        if !record.is_overdue(threshold) {
            if record.status != TaskStatus::InProgress {
                self.kv
                    .commit(WriteBatch::new().sorted_set_remove(&self.in_progress_key(), task_id))?;
            }
            return Ok(None);
        }

        let owner = record.worker_id.clone();
        let batch = self.guarded(&record);
        if record.attempts_exhausted(max_attempts) {
            record.exhaust(now);
        } else {
            record.requeue(now);
        }
        let batch = self.transition(batch, TaskStatus::InProgress, &record);

        if self.kv.commit(batch)? {
            Ok(Some((record, owner)))
        } else {
            debug!(task_id, "Overdue task changed during recovery, skipping");
            Ok(None)
        }
    }
}

impl<K: KeyValueStore> TaskStorage for RedisTaskStore<K> {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn enqueue(&self, task_type: &str, payload: &str, metadata: Metadata) -> Result<TaskRecord> {
        let record = TaskRecord::new(task_type, payload, metadata)?;
        let id = record.id.as_str();

        let batch = WriteBatch::new()
            .hash_set(&self.task_key(id), full_fields(&record)?)
            .set_add(&self.all_key(), id)
            .set_add(&self.status_key(TaskStatus::Pending), id)
            .sorted_set_add(&self.pending_key(), id, record.created_at);
        self.kv.commit(batch)?;

        debug!(task_id = %record.id, task_type = %record.task_type, "Persisted new task");
        Ok(record)
    }

    fn dequeue(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        let pending_key = self.pending_key();

        // ZPOPMIN hands each id to exactly one caller; the guarded commit
        // then rejects ids whose record moved on since they were queued.
        while let Some((task_id, score)) = self.kv.sorted_set_pop_min(&pending_key)? {
            if let Some(record) = self.claim_popped(&task_id, score, worker_id)? {
                debug!(task_id = %record.id, worker_id, attempts = record.attempts, "Leased task");
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    fn ack(&self, task_id: &str, success: bool, result: Option<String>) -> Result<TaskRecord> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let mut record = self
                .load(task_id)?
                .ok_or_else(|| PersistenceError::not_found(task_id))?;

            let before = record.status;
            let batch = self.guarded(&record);
            record.finish(success, result.clone(), now_millis())?;
            let batch = self.transition(batch, before, &record);

            if self.kv.commit(batch)? {
                debug!(task_id, status = %record.status, "Acknowledged task");
                return Ok(record);
            }
        }

        Err(PersistenceError::Contention(task_id.to_string()))
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let set_key = match status {
            Some(status) => self.status_key(status),
            None => self.all_key(),
        };

        let mut records = Vec::new();
        for task_id in self.kv.set_members(&set_key)? {
            if let Some(record) = self.load(&task_id)? {
                // Index sets trail the record by at most one batch
                if status.map_or(true, |s| s == record.status) {
                    records.push(record);
                }
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.load(task_id)
    }

    fn heartbeat(&self, task_id: &str) -> Result<TaskRecord> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let mut record = self
                .load(task_id)?
                .ok_or_else(|| PersistenceError::not_found(task_id))?;

            let mut batch = self.guarded(&record);
            record.touch(now_millis());
            batch = batch.hash_set(&self.task_key(task_id), mutable_fields(&record));
            if record.status == TaskStatus::InProgress {
                batch = batch.sorted_set_add(&self.in_progress_key(), task_id, record.updated_at);
            }

            if self.kv.commit(batch)? {
                debug!(task_id, "Heartbeat refreshed task");
                return Ok(record);
            }
        }

        Err(PersistenceError::Contention(task_id.to_string()))
    }

    fn recover_overdue_tasks(&self, max_age_ms: i64, max_attempts: u32) -> Result<RecoveryReport> {
        let now = now_millis();
        let threshold = now.saturating_sub(max_age_ms);

        let candidates = self
            .kv
            .sorted_set_range_below(&self.in_progress_key(), threshold)?;

        let mut report = RecoveryReport::default();
        for task_id in candidates {
            match self.recover_one(&task_id, threshold, max_attempts, now) {
                Ok(Some((record, owner))) => {
                    report.record_owner(&record.id, owner);
                    if record.status == TaskStatus::Pending {
                        report.requeued.push(record);
                    } else {
                        report.failed.push(record);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, "Failed to recover overdue task: {}", e),
            }
        }
        // Candidates arrive in lease order; report in queue order
        report.sort();

        if !report.is_empty() {
            debug!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Recovered overdue tasks"
            );
        }
        Ok(report)
    }
}

/// Fields that change after enqueue; absent options are stored as ""
fn mutable_fields(record: &TaskRecord) -> Vec<(String, String)> {
    vec![
        ("status".to_string(), record.status.as_str().to_string()),
        ("updated_at".to_string(), record.updated_at.to_string()),
        ("result".to_string(), record.result.clone().unwrap_or_default()),
        (
            "worker_id".to_string(),
            record.worker_id.clone().unwrap_or_default(),
        ),
        ("attempts".to_string(), record.attempts.to_string()),
    ]
}

fn full_fields(record: &TaskRecord) -> Result<Vec<(String, String)>> {
    let mut fields = vec![
        ("id".to_string(), record.id.clone()),
        ("type".to_string(), record.task_type.clone()),
        ("payload".to_string(), record.payload.clone()),
        (
            "metadata".to_string(),
            serde_json::to_string(&record.metadata)?,
        ),
        ("created_at".to_string(), record.created_at.to_string()),
    ];
    fields.extend(mutable_fields(record));
    Ok(fields)
}

fn decode_record(key: &str, mut fields: HashMap<String, String>) -> Result<TaskRecord> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| PersistenceError::corrupted(key, format!("missing field {}", name)))
    };

    let id = take("id")?;
    let task_type = take("type")?;
    let payload = take("payload")?;
    let metadata_raw = take("metadata")?;
    let status_raw = take("status")?;
    let created_at_raw = take("created_at")?;
    let updated_at_raw = take("updated_at")?;
    let result = take("result").unwrap_or_default();
    let worker_id = take("worker_id").unwrap_or_default();
    let attempts_raw = take("attempts").unwrap_or_else(|_| "0".to_string());

    let metadata: Metadata = serde_json::from_str(&metadata_raw)
        .map_err(|e| PersistenceError::corrupted(key, e.to_string()))?;
    let status: TaskStatus = status_raw
        .parse()
        .map_err(|_| PersistenceError::corrupted(key, format!("unknown status {}", status_raw)))?;
    let created_at = parse_number(key, "created_at", &created_at_raw)?;
    let updated_at = parse_number(key, "updated_at", &updated_at_raw)?;
    let attempts = parse_number(key, "attempts", &attempts_raw)?;

    Ok(TaskRecord {
        id,
        task_type,
        payload,
        metadata,
        status,
        created_at,
        updated_at,
        result: Some(result).filter(|r| !r.is_empty()),
        worker_id: Some(worker_id).filter(|w| !w.is_empty()),
        attempts,
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, field: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| PersistenceError::corrupted(key, format!("invalid {} '{}'", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKeyValueStore;

    fn store() -> RedisTaskStore<MemoryKeyValueStore> {
        RedisTaskStore::new(MemoryKeyValueStore::new())
    }

    #[test]
    fn test_record_round_trips_through_hash() {
        let store = store();
        let mut metadata = Metadata::new();
        metadata.insert("agent".to_string(), "orion".to_string());
        let task = store.enqueue("demo", "payload", metadata).unwrap();

        let fields = store.kv.hash_get_all(&store.task_key(&task.id)).unwrap();
        assert_eq!(fields.get("status").map(String::as_str), Some("PENDING"));
        assert_eq!(fields.get("result").map(String::as_str), Some(""));
        assert_eq!(store.get_task(&task.id).unwrap().unwrap(), task);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let kv = MemoryKeyValueStore::new();
        let first = RedisTaskStore::with_namespace(kv, "first");
        first.enqueue("demo", "x", Metadata::new()).unwrap();

        let RedisTaskStore { kv, .. } = first;
        let second = RedisTaskStore::with_namespace(kv, "second");
        assert!(second.list_tasks(None).unwrap().is_empty());
        assert!(second.dequeue("worker-1").unwrap().is_none());
    }

    #[test]
    fn test_status_indexes_follow_transitions() {
        let store = store();
        let task = store.enqueue("demo", "x", Metadata::new()).unwrap();
        store.dequeue("worker-1").unwrap().unwrap();

        let pending = store.kv.set_members(&store.status_key(TaskStatus::Pending)).unwrap();
        let leased = store.kv.set_members(&store.status_key(TaskStatus::InProgress)).unwrap();
        assert!(pending.is_empty());
        assert_eq!(leased, vec![task.id.clone()]);

        store.ack(&task.id, false, Some("boom".to_string())).unwrap();
        assert!(store
            .kv
            .sorted_set_range_below(&store.in_progress_key(), i64::MAX)
            .unwrap()
            .is_empty());
        assert_eq!(
            store.kv.set_members(&store.status_key(TaskStatus::Failed)).unwrap(),
            vec![task.id]
        );
    }

    #[test]
    fn test_stale_pending_entry_is_skipped() {
        let store = store();
        let first = store.enqueue("demo", "a", Metadata::new()).unwrap();
        let second = store.enqueue("demo", "b", Metadata::new()).unwrap();

        // Finalize the first task directly, leaving its queue entry behind
        store.ack(&first.id, true, None).unwrap();
        store
            .kv
            .commit(WriteBatch::new().sorted_set_add(&store.pending_key(), &first.id, 0))
            .unwrap();

        let leased = store.dequeue("worker-1").unwrap().unwrap();
        assert_eq!(leased.id, second.id);
        assert_eq!(
            store.get_task(&first.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_missing_field_is_corruption() {
        let store = store();
        let key = store.task_key("broken");
        let fields = vec![("id".to_string(), "broken".to_string())];
        store.kv.commit(WriteBatch::new().hash_set(&key, fields)).unwrap();

        let err = store.get_task("broken").unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupted { .. }));
    }
}
