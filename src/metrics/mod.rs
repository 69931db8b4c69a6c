//! Prometheus metrics for queue operations.
//!
//! # Example
//!
//! ```ignore
//! use taskpool::metrics::{init_metrics, export_metrics};
//!
//! init_metrics()?;
//! // ... run workers ...
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, QUEUE_BACKLOG, REGISTRY, SWEEP_ENTRIES, TASKS_FINISHED,
    TASKS_PUSHED, TASK_DURATION,
};
