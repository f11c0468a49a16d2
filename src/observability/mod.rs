//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters and gauges via `metrics-rs`
//! - **Tracing**: structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `lumen_components_created` | Counter | Instances created, labelled by key |
//! | `lumen_plugins_loaded` | Gauge | Plugins currently loaded |
//! | `lumen_tasks_dispatched` | Counter | Tasks sent to workers |
//! | `lumen_tasks_completed` | Counter | Indices reported as processed |
//! | `lumen_tasks_reassigned` | Counter | Tasks requeued after a worker loss |
//! | `lumen_workers_connected` | Gauge | Workers currently connected |
//!
//! Nothing is exported unless the host installs a `metrics` recorder.
//!
//! ## Tracing
//!
//! Spans are emitted for plugin loading, master dispatch passes and worker
//! sessions. [`init_tracing`] installs a fmt subscriber for binaries that
//! don't bring their own.

mod metrics;
mod tracing_support;

pub use metrics::{
    WorkerMetrics, init_metrics, record_component_created, record_plugins_loaded,
    record_tasks_completed, record_tasks_dispatched, record_tasks_reassigned,
    record_workers_connected,
};
pub use tracing_support::{
    TracingConfig, init_tracing, span_master_pass, span_plugin_load, span_worker_session,
};
