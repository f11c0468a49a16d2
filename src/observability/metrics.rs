//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const COMPONENTS_CREATED: &str = "lumen_components_created";
const PLUGINS_LOADED: &str = "lumen_plugins_loaded";
const TASKS_DISPATCHED: &str = "lumen_tasks_dispatched";
const TASKS_COMPLETED: &str = "lumen_tasks_completed";
const TASKS_REASSIGNED: &str = "lumen_tasks_reassigned";
const WORKERS_CONNECTED: &str = "lumen_workers_connected";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        COMPONENTS_CREATED,
        Unit::Count,
        "Component instances created through the registry"
    );
    metrics::describe_gauge!(PLUGINS_LOADED, Unit::Count, "Plugins currently loaded");
    metrics::describe_counter!(
        TASKS_DISPATCHED,
        Unit::Count,
        "Tasks sent to workers (including reassignments)"
    );
    metrics::describe_counter!(
        TASKS_COMPLETED,
        Unit::Count,
        "Indices reported as processed by workers or the local handler"
    );
    metrics::describe_counter!(
        TASKS_REASSIGNED,
        Unit::Count,
        "Tasks put back on the queue after a worker was lost"
    );
    metrics::describe_gauge!(WORKERS_CONNECTED, Unit::Count, "Workers currently connected");
}

/// Record a component created under `key`.
#[inline]
pub fn record_component_created(key: &str) {
    counter!(COMPONENTS_CREATED, "key" => key.to_string()).increment(1);
}

/// Record the number of loaded plugins.
#[inline]
pub fn record_plugins_loaded(count: usize) {
    gauge!(PLUGINS_LOADED).set(count as f64);
}

/// Record the number of connected workers.
#[inline]
pub fn record_workers_connected(count: usize) {
    gauge!(WORKERS_CONNECTED).set(count as f64);
}

/// Record tasks handed to workers.
#[inline]
pub fn record_tasks_dispatched(count: u64) {
    counter!(TASKS_DISPATCHED).increment(count);
}

/// Record processed indices.
#[inline]
pub fn record_tasks_completed(processed: u64) {
    counter!(TASKS_COMPLETED).increment(processed);
}

/// Record tasks requeued after a worker loss.
#[inline]
pub fn record_tasks_reassigned(count: u64) {
    counter!(TASKS_REASSIGNED).increment(count);
}

/// Per-worker counters with pre-configured labels.
#[derive(Clone)]
pub struct WorkerMetrics {
    name: String,
    tasks: Counter,
    processed: Counter,
    failures: Counter,
}

impl WorkerMetrics {
    /// Create a collector labelled with the worker name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: counter!("lumen_worker_tasks_total", "worker" => name.to_string()),
            processed: counter!("lumen_worker_processed_total", "worker" => name.to_string()),
            failures: counter!("lumen_worker_failures_total", "worker" => name.to_string()),
        }
    }

    /// Record a finished task covering `processed` indices.
    #[inline]
    pub fn record_task(&self, processed: u64) {
        self.tasks.increment(1);
        self.processed.increment(processed);
    }

    /// Record a task whose handler failed.
    #[inline]
    pub fn record_failure(&self) {
        self.failures.increment(1);
    }

    /// Get the worker name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_worker_metrics() {
        let metrics = WorkerMetrics::new("w1");
        metrics.record_task(10);
        metrics.record_failure();
        assert_eq!(metrics.name(), "w1");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: all of these are no-ops
        record_component_created("context::default");
        record_plugins_loaded(2);
        record_workers_connected(3);
        record_tasks_dispatched(1);
        record_tasks_completed(64);
        record_tasks_reassigned(1);
    }
}
