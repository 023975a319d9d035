use crate::{TaskId, TaskRecord};
use std::collections::BTreeMap;

/// Outcome of one overdue-lease sweep.
///
/// `requeued` tasks went back to PENDING; `failed` tasks ran out of attempts
/// and were finalized as FAILED. Both lists are ordered by `created_at`, then id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<TaskRecord>,
    pub failed: Vec<TaskRecord>,

    /// Worker that held each expired lease, keyed by task id
    pub previous_workers: BTreeMap<TaskId, String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    /// Remember who held the lease before the sweep cleared it
    pub fn record_owner(&mut self, task_id: &str, worker_id: Option<String>) {
        if let Some(worker_id) = worker_id {
            self.previous_workers.insert(task_id.to_string(), worker_id);
        }
    }

    pub fn previous_worker(&self, task_id: &str) -> Option<&str> {
        self.previous_workers.get(task_id).map(String::as_str)
    }

    /// Put both lists in `(created_at, id)` order
    pub fn sort(&mut self) {
        let order = |a: &TaskRecord, b: &TaskRecord| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        };
        self.requeued.sort_by(order);
        self.failed.sort_by(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;

    #[test]
    fn test_sort_orders_by_creation() {
        let mut first = TaskRecord::new("demo", "a", Metadata::new()).unwrap();
        let mut second = TaskRecord::new("demo", "b", Metadata::new()).unwrap();
        first.created_at = 10;
        second.created_at = 5;

        let mut report = RecoveryReport {
            requeued: vec![first.clone(), second.clone()],
            ..RecoveryReport::default()
        };
        report.sort();
        assert_eq!(report.requeued, vec![second, first]);
    }

    #[test]
    fn test_previous_workers() {
        let mut report = RecoveryReport::default();
        report.record_owner("a", Some("worker-1".to_string()));
        report.record_owner("b", None);

        assert_eq!(report.previous_worker("a"), Some("worker-1"));
        assert_eq!(report.previous_worker("b"), None);
    }
}
