use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;

/// Counter names emitted by the queue service
pub const TASKS_ENQUEUED: &str = "tasks_enqueued";
pub const TASKS_DISPATCHED: &str = "tasks_dispatched";
pub const TASKS_RETRIED: &str = "tasks_retried";
pub const TASKS_FAILED_TIMEOUT: &str = "tasks_failed_timeout";
pub const TASKS_COMPLETED: &str = "tasks_completed";
pub const TASKS_FAILED: &str = "tasks_failed";

/// Destination for queue counters. Implementations must not fail.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, amount: u64);
}

/// Prometheus metrics for the broker
pub struct QueueMetrics {
    pub registry: Registry,

    /// Queue events by name
    pub events_total: IntCounterVec,
}

impl QueueMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("tq_queue_events_total", "Queue events by event name"),
            &["event"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        Ok(QueueMetrics {
            registry,
            events_total,
        })
    }

    /// Current value of one event counter
    pub fn value(&self, name: &str) -> u64 {
        self.events_total.with_label_values(&[name]).get()
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for QueueMetrics {
    fn increment(&self, name: &str, amount: u64) {
        self.events_total.with_label_values(&[name]).inc_by(amount);
    }
}

/// Counters kept in a plain map, for embedding and tests
#[derive(Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for MemoryMetrics {
    fn increment(&self, name: &str, amount: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_counters() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.increment(TASKS_ENQUEUED, 1);
        metrics.increment(TASKS_ENQUEUED, 2);
        metrics.increment(TASKS_RETRIED, 4);

        assert_eq!(metrics.value(TASKS_ENQUEUED), 3);
        assert_eq!(metrics.value(TASKS_RETRIED), 4);
        assert_eq!(metrics.value(TASKS_FAILED), 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("tq_queue_events_total{event=\"tasks_enqueued\"} 3"));
    }

    #[test]
    fn test_memory_counters() {
        let metrics = MemoryMetrics::new();
        metrics.increment(TASKS_DISPATCHED, 1);
        metrics.increment(TASKS_DISPATCHED, 1);

        assert_eq!(metrics.get(TASKS_DISPATCHED), 2);
        assert_eq!(metrics.get(TASKS_COMPLETED), 0);
        assert_eq!(metrics.snapshot().len(), 1);
    }
}
