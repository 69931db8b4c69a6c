//! Recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, QUEUE_BACKLOG, SWEEP_ENTRIES, TASKS_FINISHED, TASKS_PUSHED,
    TASK_DURATION,
};

/// Records queue metrics.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has
/// been called, so library users who never export metrics pay nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a push attempt.
    ///
    /// * `outcome` - `"enqueued"`, `"delayed"` or `"duplicate"`
    pub fn record_push(&self, channel: &str, outcome: &str) {
        if let Some(pushed) = TASKS_PUSHED.get() {
            pushed.with_label_values(&[channel, outcome]).inc();
        }

        tracing::trace!(channel = channel, outcome = outcome, "Recorded push metric");
    }

    /// Record a completion.
    ///
    /// * `status` - `"completed"` or `"failed"`
    pub fn record_finished(&self, channel: &str, status: &str) {
        if let Some(finished) = TASKS_FINISHED.get() {
            finished.with_label_values(&[channel, status]).inc();
        }
    }

    /// Record how long a worker spent invoking a task.
    pub fn record_duration(&self, channel: &str, duration_secs: f64) {
        if let Some(duration) = TASK_DURATION.get() {
            duration.with_label_values(&[channel]).observe(duration_secs);
        }
    }

    pub fn set_backlog(&self, channel: &str, backlog: u64) {
        if let Some(gauge) = QUEUE_BACKLOG.get() {
            gauge.with_label_values(&[channel]).set(backlog as f64);
        }
    }

    /// Record pending index entries handled by a sweep.
    ///
    /// * `action` - `"promoted"`, `"requeued"` or `"dropped"`
    pub fn record_sweep(&self, channel: &str, action: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(entries) = SWEEP_ENTRIES.get() {
            entries
                .with_label_values(&[channel, action])
                .inc_by(count as f64);
        }
    }

    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    pub fn job_finished(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }

    pub fn set_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_before_and_after_init() {
        let collector = MetricsCollector::new();
        collector.record_push("mail", "enqueued");

        init_metrics().unwrap();
        collector.record_push("mail", "enqueued");
        collector.record_finished("mail", "completed");
        collector.record_duration("mail", 0.2);
        collector.set_backlog("mail", 4);
        collector.record_sweep("mail", "requeued", 2);
        collector.job_started();
        collector.job_finished();
        collector.set_active_workers(3);

        let text = export_metrics();
        assert!(text.contains("taskpool_tasks_pushed_total"));
        assert!(text.contains("taskpool_sweep_entries_total"));
    }
}
