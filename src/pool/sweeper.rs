//! Sweep of the pending index.
//!
//! The sweep promotes delayed tasks whose delay elapsed and requeues tracked
//! tasks whose completion deadline passed. Any number of sweepers may run
//! against the same store: an entry is only acted on by the caller whose
//! removal of it succeeded. When the follow-up write fails, the entry is put
//! back so a later sweep retries it.

use std::ops::AddAssign;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::queue_pool::{deadline, QueuePool};
use crate::error::QueueError;
use crate::store::{Transaction, ZAddCondition};
use crate::task::{TaskId, TaskRecord};

/// Counts of entries handled by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Delayed tasks made visible.
    pub promoted: usize,
    /// Timed-out tasks put back on the ready list.
    pub requeued: usize,
    /// Entries removed without requeue.
    pub dropped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.promoted == 0 && self.requeued == 0 && self.dropped == 0
    }

    fn count(&mut self, action: SweepAction) {
        match action {
            SweepAction::Promoted => self.promoted += 1,
            SweepAction::Requeued => self.requeued += 1,
            SweepAction::Dropped => self.dropped += 1,
        }
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.promoted += other.promoted;
        self.requeued += other.requeued;
        self.dropped += other.dropped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Promoted,
    Requeued,
    Dropped,
}

impl QueuePool {
    /// Sweeps one channel's pending index.
    ///
    /// Examines at most `sweep_batch` entries whose score is due.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` when the store fails. An entry claimed before the
    /// failure is put back in the index, due immediately.
    pub async fn sweep_channel(&self, channel: &str) -> Result<SweepReport, QueueError> {
        let pending_key = self.keys.channel_pending(channel);
        let now = self.clock.unix_seconds();
        let due = self
            .store
            .zrangebyscore(&pending_key, now as f64, self.config.sweep_batch)
            .await?;

        let mut report = SweepReport::default();
        let mut failure = None;
        for member in due {
            // Lost the race to another sweeper, or the task completed.
            if !self.store.zrem(&pending_key, &member).await? {
                continue;
            }

            let id = TaskId::from(member);
            match self.settle_entry(channel, &pending_key, &id, now).await {
                Ok(action) => report.count(action),
                Err(e) => {
                    self.restore_entry(&pending_key, &id, now).await;
                    failure = Some(e);
                    break;
                }
            }
        }

        self.metrics.record_sweep(channel, "promoted", report.promoted);
        self.metrics.record_sweep(channel, "requeued", report.requeued);
        self.metrics.record_sweep(channel, "dropped", report.dropped);
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Acts on a claimed entry according to the schedule of its input.
    async fn settle_entry(
        &self,
        channel: &str,
        pending_key: &str,
        id: &TaskId,
        now: i64,
    ) -> Result<SweepAction, QueueError> {
        let Some(mut record) = self.read_input(id).await? else {
            debug!(task_id = %id, channel, "Pending task has no input");
            return Ok(SweepAction::Dropped);
        };
        let schedule = record.schedule;

        let mut tx = Transaction::new();
        let action = if schedule.is_delayed() {
            // From here on the task is an ordinary one.
            record.schedule.delay_seconds = 0;
            tx.set_ex(self.keys.input(id), record.to_bytes()?, self.config.input_ttl);
            SweepAction::Promoted
        } else if schedule.is_timeout_tracked() && schedule.requeue_on_timeout {
            SweepAction::Requeued
        } else {
            debug!(task_id = %id, channel, "Pending task dropped");
            return Ok(SweepAction::Dropped);
        };

        if schedule.is_timeout_tracked() {
            tx.zadd(
                pending_key,
                id.as_str(),
                deadline(now, schedule.timeout_seconds),
            );
        }
        tx.sadd(self.keys.list_channels(), channel)
            .rpush(self.keys.channel(channel), vec![id.as_str().as_bytes().to_vec()]);
        self.store.exec(tx).await?;

        match action {
            SweepAction::Promoted => debug!(task_id = %id, channel, "Delayed task promoted"),
            _ => info!(
                task_id = %id,
                channel,
                timeout_seconds = schedule.timeout_seconds,
                "Timed-out task requeued"
            ),
        }
        Ok(action)
    }

    async fn restore_entry(&self, pending_key: &str, id: &TaskId, now: i64) {
        let restored = self
            .store
            .zadd(pending_key, id.as_str(), now as f64, ZAddCondition::IfAbsent)
            .await;
        match restored {
            Ok(_) => debug!(task_id = %id, "Pending entry restored after failed sweep"),
            Err(e) => error!(task_id = %id, error = %e, "Failed to restore pending entry"),
        }
    }

    /// Sweeps every known channel. A failing channel is logged and skipped.
    pub async fn sweep_all(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();
        for channel in self.list_channels().await? {
            match self.sweep_channel(&channel).await {
                Ok(channel_report) => report += channel_report,
                Err(e) => warn!(channel = %channel, error = %e, "Sweep failed"),
            }
        }
        Ok(report)
    }

    /// Input record of a task, if still stored and decodable.
    async fn read_input(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let Some(raw) = self.store.get(&self.keys.input(id)).await? else {
            return Ok(None);
        };
        match TaskRecord::from_slice(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Undecodable input record");
                Ok(None)
            }
        }
    }
}

/// Runs [`QueuePool::sweep_all`] on a fixed interval.
#[derive(Debug, Clone)]
pub struct Sweeper {
    pool: QueuePool,
    interval: Duration,
}

impl Sweeper {
    /// Sweeper using the pool's configured interval.
    pub fn new(pool: QueuePool) -> Self {
        let interval = pool.config().sweep_interval;
        Self { pool, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweeps until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => match self.pool.sweep_all().await {
                    Ok(report) if !report.is_empty() => info!(
                        promoted = report.promoted,
                        requeued = report.requeued,
                        dropped = report.dropped,
                        "Sweep finished"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sweep failed"),
                },
            }
        }

        info!("Sweeper stopped");
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
