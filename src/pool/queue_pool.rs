//! The enqueue/pop/complete/wait protocol.
//!
//! [`QueuePool`] is the single implementation of the protocol. Every
//! operation suspends only at store round trips, so one runtime can multiplex
//! any number of concurrent waits. [`BlockingQueuePool`](super::BlockingQueuePool)
//! drives the same code from synchronous callers.
//!
//! # Atomicity
//!
//! Multi-key updates (push, complete, sweep requeue) are a single store
//! transaction. Duplicate suppression for caller-chosen ids relies on the
//! conditional insert into the pending index that precedes the transaction.
//! The index is keyed by task id alone, so an id is scheduled at most once
//! whatever its delay or timeout; the sweep reads the schedule back from the
//! stored input.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::keys::KeySpace;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{QueueError, TaskError};
use crate::metrics::MetricsCollector;
use crate::store::{RedisStore, Store, StoreError, Transaction, ZAddCondition};
use crate::task::{JobRegistry, Task, TaskCallback, TaskCollection, TaskId, TaskRecord};

/// Pause between attempts of a retried read.
const READ_BACKOFF: Duration = Duration::from_millis(50);

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Visible on the ready list now.
    Enqueued,
    /// Parked in the pending index until the sweep promotes it.
    Delayed,
    /// The id is already scheduled; nothing was written.
    Duplicate,
}

impl PushOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Delayed => "delayed",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Tasks ever pushed.
    pub total: u64,
    /// Tasks waiting on the ready list.
    pub backlog: u64,
    /// `total - backlog`.
    pub complete: u64,
}

/// Handle on the queue protocol.
///
/// Cheap to clone; clones share the store handle.
#[derive(Clone)]
pub struct QueuePool {
    pub(super) store: Arc<dyn Store>,
    pub(super) registry: Arc<JobRegistry>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) keys: KeySpace,
    pub(super) config: Arc<QueueConfig>,
    pub(super) metrics: MetricsCollector,
}

impl QueuePool {
    /// Creates a pool over an existing store.
    pub fn new(store: Arc<dyn Store>, registry: JobRegistry, config: QueueConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            keys: KeySpace::new(config.prefix.clone()),
            config: Arc::new(config),
            metrics: MetricsCollector::new(),
        }
    }

    /// Connects to the Redis server named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if the connection fails.
    pub async fn connect(config: QueueConfig, registry: JobRegistry) -> Result<Self, QueueError> {
        let store = RedisStore::connect(&config.redis_url).await?;
        info!(url = %config.redis_url, prefix = %config.prefix, "Queue pool connected");
        Ok(Self::new(Arc::new(store), registry, config))
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Draws the next id from the shared sequence.
    pub async fn next_id(&self) -> Result<TaskId, QueueError> {
        let id = self.store.incr(&self.keys.task_seq()).await?;
        Ok(TaskId::from(id))
    }

    /// Enqueues a task.
    ///
    /// Assigns an id when the task has none, runs the job's
    /// `before_enqueue` hook, then schedules the task according to its
    /// [`Schedule`](crate::task::Schedule).
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the store fails or the task cannot be
    /// serialized. A duplicate is not an error.
    pub async fn push(&self, task: &mut Task) -> Result<PushOutcome, QueueError> {
        let auto_id = task.id().is_none();
        if auto_id {
            let id = self.next_id().await?;
            task.assign_id(id);
        }
        task.before_enqueue();

        let id = task
            .id()
            .cloned()
            .ok_or_else(|| QueueError::IncorrectState("task has no id after assignment".into()))?;
        let channel = task.channel().to_string();
        let schedule = *task.schedule();
        let payload = task.to_input_record()?.to_bytes()?;
        let now = self.clock.unix_seconds();
        let pending_key = self.keys.channel_pending(&channel);
        // A delayed input must outlive its delay.
        let input_ttl = if schedule.is_delayed() {
            self.config.input_ttl + Duration::from_secs(schedule.delay_seconds)
        } else {
            self.config.input_ttl
        };

        let mut tx = Transaction::new();
        let outcome = if schedule.is_delayed() {
            let condition = if schedule.delay_overwrite {
                ZAddCondition::Always
            } else {
                ZAddCondition::IfAbsent
            };
            let inserted = self
                .store
                .zadd(
                    &pending_key,
                    id.as_str(),
                    deadline(now, schedule.delay_seconds),
                    condition,
                )
                .await?;
            if !inserted && !schedule.delay_overwrite {
                PushOutcome::Duplicate
            } else {
                PushOutcome::Delayed
            }
        } else if schedule.is_timeout_tracked() {
            let score = deadline(now, schedule.timeout_seconds);
            if auto_id {
                // A fresh id cannot collide; track it inside the transaction.
                tx.zadd(pending_key.clone(), id.as_str(), score);
                PushOutcome::Enqueued
            } else if self
                .store
                .zadd(&pending_key, id.as_str(), score, ZAddCondition::IfAbsent)
                .await?
            {
                PushOutcome::Enqueued
            } else {
                PushOutcome::Duplicate
            }
        } else {
            PushOutcome::Enqueued
        };

        self.metrics.record_push(&channel, outcome.as_str());

        if outcome.is_duplicate() {
            debug!(task_id = %id, channel = %channel, "Duplicate push ignored");
            return Ok(outcome);
        }

        tx.publish(self.keys.enqueue_topic(&channel), payload.clone())
            .sadd(self.keys.list_channels(), channel.clone());
        if outcome == PushOutcome::Enqueued {
            tx.rpush(self.keys.channel(&channel), vec![id.as_str().as_bytes().to_vec()]);
        }
        tx.incr(self.keys.channel_total(&channel))
            .set_ex(self.keys.input(&id), payload, input_ttl)
            .del(vec![self.keys.output(&id), self.keys.signal(&id)]);

        self.store.exec(tx).await?;

        debug!(
            task_id = %id,
            channel = %channel,
            kind = task.kind(),
            outcome = outcome.as_str(),
            "Task pushed"
        );
        Ok(outcome)
    }

    /// Pushes a task and waits for its result.
    pub async fn push_wait(&self, task: &mut Task, timeout: Duration) -> Result<Task, QueueError> {
        self.push(task).await?;
        self.wait(task, timeout).await
    }

    /// Takes the next ready task.
    ///
    /// `None` selects every known channel. Returns `Ok(None)` when nothing
    /// arrived within the pop timeout, when the task's input has expired, or
    /// when its record cannot be decoded; callers simply poll again.
    pub async fn pop(&self, channels: Option<&[String]>) -> Result<Option<Task>, QueueError> {
        let channels = match channels {
            Some(channels) => channels.to_vec(),
            None => self.list_channels().await?,
        };
        if channels.is_empty() {
            tokio::time::sleep(self.config.pop_timeout).await;
            return Ok(None);
        }

        let ready_keys: Vec<String> = channels.iter().map(|c| self.keys.channel(c)).collect();
        let Some((key, raw_id)) = self.blocking_read(&ready_keys).await else {
            return Ok(None);
        };

        let id = TaskId::from(String::from_utf8_lossy(&raw_id).into_owned());
        let channel = self
            .keys
            .channel_of(&key)
            .map(str::to_string)
            .unwrap_or_else(|| key.clone());

        let raw = match self.store.get(&self.keys.input(&id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(task_id = %id, channel = %channel, "Popped task has no input");
                return Ok(None);
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to read popped task");
                return Ok(None);
            }
        };

        match self.decode_task(&raw) {
            Ok(mut task) => {
                task.set_channel(channel);
                debug!(task_id = %id, channel = task.channel(), kind = task.kind(), "Task popped");
                Ok(Some(task))
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to decode popped task");
                Ok(None)
            }
        }
    }

    /// Records the outcome of an invoked task and wakes its waiters.
    ///
    /// Safe to call more than once for the same task.
    pub async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        let record = task.to_record()?;
        self.complete_record(&record).await
    }

    /// Same as [`complete`](Self::complete), from an already built record.
    pub async fn complete_record(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| QueueError::IncorrectState("cannot complete a task without an id".into()))?;
        let payload = record.to_bytes()?;
        let output_key = self.keys.output(&id);
        let signal_key = self.keys.signal(&id);

        let mut tx = Transaction::new();
        tx.publish(output_key.clone(), payload.clone())
            .publish(self.keys.complete_topic(&record.channel), payload.clone())
            .set_ex(output_key, payload, self.config.output_ttl);
        if record.schedule.is_timeout_tracked() {
            tx.zrem(self.keys.channel_pending(&record.channel), id.as_str());
        }
        let sentinels = (1..=self.config.signal_batch)
            .map(|n| n.to_string().into_bytes())
            .collect();
        tx.rpush(signal_key.clone(), sentinels)
            .expire(signal_key, self.config.signal_ttl)
            .del(vec![self.keys.input(&id)]);

        self.store.exec(tx).await?;

        let status = if record.has_exception() { "failed" } else { "completed" };
        self.metrics.record_finished(&record.channel, status);
        debug!(task_id = %id, channel = %record.channel, status, "Task completed");
        Ok(())
    }

    /// Callback that completes the task through this pool.
    ///
    /// Completion errors are logged; the task outcome itself is unaffected.
    pub fn completion_callback(&self) -> TaskCallback {
        let pool = self.clone();
        Box::new(move |task: &Task| {
            let record = task.to_record();
            let task_id = task.id().cloned();
            async move {
                let result = match record {
                    Ok(record) => pool.complete_record(&record).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    warn!(task_id = ?task_id, error = %e, "Failed to complete task");
                }
            }
            .boxed()
        })
    }

    /// Waits for one task to finish and returns its resolved copy.
    ///
    /// # Errors
    ///
    /// - `QueueError::IncorrectState` if the task has no id, or if its output
    ///   is missing after the completion signal
    /// - `QueueError::WaitTimeout` if no signal arrived within `timeout`
    pub async fn wait(&self, task: &Task, timeout: Duration) -> Result<Task, QueueError> {
        let id = task
            .id()
            .cloned()
            .ok_or_else(|| QueueError::IncorrectState("cannot wait for a task without an id".into()))?;
        let signal = vec![self.keys.signal(&id)];
        let started = Instant::now();

        loop {
            if self.blocking_read(&signal).await.is_some() {
                break;
            }
            if started.elapsed() >= timeout {
                debug!(task_id = %id, ?timeout, "Wait timed out");
                return Err(QueueError::WaitTimeout(timeout));
            }
        }

        let raw = self
            .read_with_retry(&self.keys.output(&id))
            .await?
            .ok_or_else(|| {
                QueueError::IncorrectState(format!(
                    "output of task {} is missing after its completion signal",
                    id
                ))
            })?;
        self.decode_task(&raw)
    }

    /// Waits for any of the collection's pending tasks.
    ///
    /// Returns once every task resolved, right after the first completion
    /// signal, or when `timeout` elapsed without any signal. Callers wanting
    /// the whole batch call again while [`TaskCollection::is_resolved`] is
    /// false. A task whose output cannot be read after its signal is resolved
    /// as failed with an incorrect-state error.
    pub async fn wait_collection(
        &self,
        collection: &mut TaskCollection,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut signal_keys: Vec<String> = Vec::new();
        for task in collection.pending() {
            let id = task.id().ok_or_else(|| {
                QueueError::IncorrectState("collection holds a task without an id".into())
            })?;
            let key = self.keys.signal(id);
            if !signal_keys.contains(&key) {
                signal_keys.push(key);
            }
        }
        if signal_keys.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut signals = 0usize;
        loop {
            if let Some((key, _)) = self.blocking_read(&signal_keys).await {
                signals += 1;
                signal_keys.retain(|k| k != &key);

                let keys = &self.keys;
                let finished =
                    collection.detach_pending(|t| t.id().is_some_and(|id| keys.signal(id) == key));
                for original in finished {
                    let resolved = self.resolve_output(original).await;
                    collection.resolve(resolved);
                }
            }

            if collection.is_resolved() || signals > 0 || started.elapsed() >= timeout {
                break;
            }
        }
        Ok(())
    }

    /// Known channel names, sorted.
    pub async fn list_channels(&self) -> Result<Vec<String>, QueueError> {
        let mut channels = self.store.smembers(&self.keys.list_channels()).await?;
        channels.sort();
        Ok(channels)
    }

    /// Lifetime and backlog counters of a channel.
    pub async fn channel_stats(&self, channel: &str) -> Result<ChannelStats, QueueError> {
        let total = self
            .store
            .get(&self.keys.channel_total(channel))
            .await?
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let backlog = self.store.llen(&self.keys.channel(channel)).await?;
        self.metrics.set_backlog(channel, backlog);

        Ok(ChannelStats {
            total,
            backlog,
            complete: total.saturating_sub(backlog),
        })
    }

    /// Tasks in a channel's pending index, by rank (inclusive, negative
    /// indexes count from the end). Expired or undecodable inputs are skipped.
    pub async fn pending_tasks(
        &self,
        channel: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Task>, QueueError> {
        let members = self
            .store
            .zrange(&self.keys.channel_pending(channel), start, stop)
            .await?;
        let input_keys: Vec<String> = members
            .into_iter()
            .map(|member| self.keys.input(&TaskId::from(member)))
            .collect();

        let tasks = self
            .store
            .mget(&input_keys)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|raw| self.decode_task(&raw).ok())
            .collect();
        Ok(tasks)
    }

    /// Pushes back the deadlines of timeout-tracked tasks still pending.
    ///
    /// Returns how many deadlines moved.
    pub async fn update_timeouts(&self, tasks: &[&Task]) -> Result<usize, QueueError> {
        let now = self.clock.unix_seconds();
        let mut updated = 0;
        for task in tasks {
            let (Some(id), timeout) = (task.id(), task.schedule().timeout_seconds) else {
                continue;
            };
            if timeout == 0 {
                continue;
            }
            let changed = self
                .store
                .zadd(
                    &self.keys.channel_pending(task.channel()),
                    id.as_str(),
                    deadline(now, timeout),
                    ZAddCondition::IfPresent,
                )
                .await?;
            if changed {
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub(super) fn decode_task(&self, raw: &[u8]) -> Result<Task, QueueError> {
        let record = TaskRecord::from_slice(raw)?;
        Ok(Task::from_record(record, &self.registry)?)
    }

    /// One short blocking pop, retrying transient store errors.
    async fn blocking_read(&self, keys: &[String]) -> Option<(String, Vec<u8>)> {
        let attempts = self.config.read_retries.max(1);
        for attempt in 1..=attempts {
            match self.store.blpop(keys, self.config.pop_timeout).await {
                Ok(hit) => return hit,
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Blocking pop failed");
                    tokio::time::sleep(READ_BACKOFF * attempt).await;
                }
            }
        }
        None
    }

    /// Reads a key, retrying while it is absent or the store errors.
    async fn read_with_retry(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let attempts = self.config.read_retries.max(1);
        let mut outcome: Result<Option<Vec<u8>>, StoreError> = Ok(None);
        for attempt in 1..=attempts {
            outcome = self.store.get(key).await;
            if matches!(outcome, Ok(Some(_))) {
                break;
            }
            if attempt < attempts {
                tokio::time::sleep(READ_BACKOFF).await;
            }
        }
        Ok(outcome?)
    }

    async fn resolve_output(&self, mut original: Task) -> Task {
        let Some(id) = original.id().cloned() else {
            return original;
        };
        let failure = match self.read_with_retry(&self.keys.output(&id)).await {
            Ok(Some(raw)) => match self.decode_task(&raw) {
                Ok(task) => return task,
                Err(e) => format!("output of task {} could not be decoded: {}", id, e),
            },
            Ok(None) => format!("output of task {} is missing after its completion signal", id),
            Err(e) => format!("output of task {} could not be read: {}", id, e),
        };
        warn!(task_id = %id, reason = %failure, "Marking task failed");
        original.set_exception(TaskError::IncorrectState(failure));
        original
    }
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePool")
            .field("prefix", &self.keys.prefix())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Sorted set score `seconds` from `now`.
pub(super) fn deadline(now: i64, seconds: u64) -> f64 {
    now.saturating_add(seconds as i64) as f64
}
