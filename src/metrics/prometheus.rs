//! Prometheus metrics registration and export.
//!
//! Metrics live in process-wide statics. Nothing is recorded until
//! [`init_metrics`] has run; before that every recording call is a no-op.

use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskpool metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks pushed, labeled by channel and outcome (enqueued, delayed, duplicate).
pub static TASKS_PUSHED: OnceLock<CounterVec> = OnceLock::new();

/// Tasks completed, labeled by channel and status (completed, failed).
pub static TASKS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Time spent invoking a task in a worker, labeled by channel.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Ready list length observed by the last stats call, labeled by channel.
pub static QUEUE_BACKLOG: OnceLock<GaugeVec> = OnceLock::new();

/// Pending index entries handled by the sweep, labeled by channel and action.
pub static SWEEP_ENTRIES: OnceLock<CounterVec> = OnceLock::new();

/// Tasks currently being invoked by workers.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful call has no effect on the statics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_pushed = CounterVec::new(
        Opts::new("taskpool_tasks_pushed_total", "Total number of push attempts"),
        &["channel", "outcome"],
    )?;

    let tasks_finished = CounterVec::new(
        Opts::new("taskpool_tasks_finished_total", "Total number of completed tasks"),
        &["channel", "status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "taskpool_task_duration_seconds",
            "Task invocation duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["channel"],
    )?;

    let queue_backlog = GaugeVec::new(
        Opts::new("taskpool_queue_backlog", "Number of tasks waiting on a ready list"),
        &["channel"],
    )?;

    let sweep_entries = CounterVec::new(
        Opts::new("taskpool_sweep_entries_total", "Pending index entries handled by the sweep"),
        &["channel", "action"],
    )?;

    let jobs_in_progress = Gauge::new(
        "taskpool_jobs_in_progress",
        "Number of tasks currently being invoked",
    )?;

    let active_workers = Gauge::new("taskpool_active_workers", "Number of active workers")?;

    registry.register(Box::new(tasks_pushed.clone()))?;
    registry.register(Box::new(tasks_finished.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_backlog.clone()))?;
    registry.register(Box::new(sweep_entries.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already initialized if any of these fail.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_PUSHED.set(tasks_pushed);
    let _ = TASKS_FINISHED.set(tasks_finished);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_BACKLOG.set(queue_backlog);
    let _ = SWEEP_ENTRIES.set(sweep_entries);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Global state: another test may have initialized first.
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }
}
