//! Tasks: the unit of work moved through the queue.
//!
//! A [`Task`] wraps a type-erased [`Job`] together with its identity, target
//! channel, [`Schedule`], and the outcome of running it. Tasks are
//! process-local views; the queue pool moves them through the store as
//! [`TaskRecord`]s.
//!
//! # Lifecycle
//!
//! `created → enqueued → popped → invoked → completed | failed`
//!
//! A task is invoked at most once. Its completion callback runs exactly once,
//! after `after()`, whatever the outcome.

mod collection;
mod job;
mod record;
mod registry;

pub use collection::TaskCollection;
pub use job::{DynJob, Job, JobContext};
pub use record::{Schedule, TaskId, TaskRecord};
pub use registry::JobRegistry;

use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{RegistryError, TaskError};

/// Channel used when neither the task nor its job names one.
pub const DEFAULT_CHANNEL: &str = "default";

/// Callback run once a task reaches a terminal state.
pub type TaskCallback = Box<dyn FnOnce(&Task) -> BoxFuture<'static, ()> + Send + Sync>;

/// A unit of work.
pub struct Task {
    id: Option<TaskId>,
    channel: Option<String>,
    schedule: Schedule,
    job: Box<dyn DynJob>,
    exception: Option<TaskError>,
    log: Vec<String>,
    invoked: bool,
    callback: Option<TaskCallback>,
}

impl Task {
    /// Creates a task carrying the given job.
    pub fn new<J: Job>(job: J) -> Self {
        Self::from_dyn(Box::new(job))
    }

    pub fn from_dyn(job: Box<dyn DynJob>) -> Self {
        Self {
            id: None,
            channel: None,
            schedule: Schedule::default(),
            job,
            exception: None,
            log: Vec::new(),
            invoked: false,
            callback: None,
        }
    }

    /// Sets a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.schedule.delay_seconds = seconds;
        self
    }

    pub fn with_delay_overwrite(mut self, overwrite: bool) -> Self {
        self.schedule.delay_overwrite = overwrite;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.schedule.timeout_seconds = seconds;
        self
    }

    pub fn with_requeue_on_timeout(mut self, requeue: bool) -> Self {
        self.schedule.requeue_on_timeout = requeue;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    pub(crate) fn assign_id(&mut self, id: TaskId) {
        if self.id.is_none() {
            self.id = Some(id);
        }
    }

    /// Target channel, falling back to the job's default and then `"default"`.
    pub fn channel(&self) -> &str {
        self.channel
            .as_deref()
            .or_else(|| self.job.default_channel())
            .unwrap_or(DEFAULT_CHANNEL)
    }

    pub(crate) fn set_channel(&mut self, channel: impl Into<String>) {
        self.channel = Some(channel.into());
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn kind(&self) -> &'static str {
        self.job.kind()
    }

    /// Borrows the job as its concrete type.
    pub fn job<J: Job>(&self) -> Option<&J> {
        self.job.as_any().downcast_ref::<J>()
    }

    pub fn job_mut<J: Job>(&mut self) -> Option<&mut J> {
        self.job.as_any_mut().downcast_mut::<J>()
    }

    pub fn exception(&self) -> Option<&TaskError> {
        self.exception.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Marks the task failed without running it.
    pub(crate) fn set_exception(&mut self, error: TaskError) {
        if self.exception.is_none() {
            self.exception = Some(error);
        }
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log
    }

    pub fn is_invoked(&self) -> bool {
        self.invoked
    }

    /// Sets the callback run when the task finishes.
    pub fn set_callback(&mut self, callback: TaskCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn before_enqueue(&mut self) {
        self.job.before_enqueue();
    }

    /// Runs the job once.
    ///
    /// Failures of the job are recorded on the task, not returned.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::InvalidState` if the task was already invoked.
    pub async fn invoke(&mut self) -> Result<(), TaskError> {
        if self.invoked {
            return Err(TaskError::InvalidState(format!(
                "task {} has already been invoked",
                self.display_id()
            )));
        }
        self.invoked = true;

        let mut ctx = JobContext::new(
            self.id.clone(),
            self.channel().to_string(),
            std::mem::take(&mut self.log),
        );

        let job = &mut self.job;
        let outcome = AssertUnwindSafe(async {
            job.before(&mut ctx).await?;
            job.execute(&mut ctx).await
        })
        .catch_unwind()
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(match err.downcast::<TaskError>() {
                Ok(task_err) => task_err,
                Err(other) => TaskError::runtime(&other),
            }),
            Err(panic) => Some(TaskError::Runtime(format!(
                "Uncaught panic: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match failure {
            None => self.complete(ctx).await,
            Some(error) => self.fail(error, ctx).await,
        }
        Ok(())
    }

    async fn complete(&mut self, mut ctx: JobContext) {
        let callback = self.callback.take();
        self.job.after(&mut ctx).await;
        self.log = ctx.into_lines();
        debug!(task_id = %self.display_id(), kind = self.kind(), "Task completed");
        self.run_callback(callback).await;
    }

    async fn fail(&mut self, error: TaskError, mut ctx: JobContext) {
        let callback = self.callback.take();
        warn!(task_id = %self.display_id(), kind = self.kind(), error = %error, "Task failed");
        self.exception = Some(error.clone());
        self.job.on_exception(&error, &mut ctx).await;
        self.job.after(&mut ctx).await;
        self.log = ctx.into_lines();
        self.run_callback(callback).await;
    }

    async fn run_callback(&self, callback: Option<TaskCallback>) {
        if let Some(callback) = callback {
            let pending = callback(self);
            pending.await;
        }
    }

    fn display_id(&self) -> String {
        self.id
            .as_ref()
            .map_or_else(|| "<unassigned>".to_string(), |id| id.to_string())
    }

    /// Record stored under the input key: no exception, no log.
    pub fn to_input_record(&self) -> Result<TaskRecord, serde_json::Error> {
        Ok(TaskRecord {
            id: self.id.clone(),
            channel: self.channel().to_string(),
            kind: self.kind().to_string(),
            payload: self.job.to_payload()?,
            schedule: self.schedule,
            exception: None,
            log: Vec::new(),
        })
    }

    /// Full record, including the outcome.
    pub fn to_record(&self) -> Result<TaskRecord, serde_json::Error> {
        let mut record = self.to_input_record()?;
        record.exception = self.exception.clone();
        record.log = self.log.clone();
        Ok(record)
    }

    /// Rebuilds a task from its record.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the kind is unknown or the payload does not
    /// decode into it.
    pub fn from_record(record: TaskRecord, registry: &JobRegistry) -> Result<Self, RegistryError> {
        let job = registry.decode(&record.kind, record.payload)?;
        Ok(Self {
            id: record.id,
            channel: Some(record.channel),
            schedule: record.schedule,
            job,
            exception: record.exception,
            log: record.log,
            invoked: false,
            callback: None,
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("channel", &self.channel())
            .field("kind", &self.kind())
            .field("schedule", &self.schedule)
            .field("exception", &self.exception)
            .field("invoked", &self.invoked)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Echo, Fail, Sum};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Hooked {
        #[serde(default)]
        trace: Vec<String>,
        #[serde(default)]
        fail: bool,
    }

    #[async_trait]
    impl Job for Hooked {
        const KIND: &'static str = "hooked";

        async fn before(&mut self, _ctx: &mut JobContext) -> anyhow::Result<()> {
            self.trace.push("before".into());
            Ok(())
        }

        async fn execute(&mut self, _ctx: &mut JobContext) -> anyhow::Result<()> {
            self.trace.push("execute".into());
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn after(&mut self, _ctx: &mut JobContext) {
            self.trace.push("after".into());
        }

        async fn on_exception(&mut self, _error: &TaskError, _ctx: &mut JobContext) {
            self.trace.push("on_exception".into());
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Panics;

    #[async_trait]
    impl Job for Panics {
        const KIND: &'static str = "panics";

        async fn execute(&mut self, _ctx: &mut JobContext) -> anyhow::Result<()> {
            panic!("worker exploded");
        }
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> TaskCallback {
        Box::new(move |_task: &Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        })
    }

    #[tokio::test]
    async fn test_invoke_twice_is_invalid_state() {
        let mut task = Task::new(Echo::new("hi"));
        task.invoke().await.unwrap();

        let err = task.invoke().await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidState(_)));
        assert!(!task.has_exception());
    }

    #[tokio::test]
    async fn test_success_runs_hooks_in_order() {
        let mut task = Task::new(Hooked::default());
        task.invoke().await.unwrap();

        let job = task.job::<Hooked>().unwrap();
        assert_eq!(job.trace, ["before", "execute", "after"]);
        assert!(!task.has_exception());
    }

    #[tokio::test]
    async fn test_failure_wraps_foreign_error() {
        let mut task = Task::new(Hooked {
            fail: true,
            ..Default::default()
        });
        task.invoke().await.unwrap();

        let job = task.job::<Hooked>().unwrap();
        assert_eq!(job.trace, ["before", "execute", "on_exception", "after"]);
        assert_eq!(
            task.exception(),
            Some(&TaskError::Runtime("Uncaught exception: boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_task_error_recorded_as_is() {
        let mut task = Task::new(Fail::new("nope"));
        task.invoke().await.unwrap();
        assert_eq!(task.exception(), Some(&TaskError::Failed("nope".to_string())));
    }

    #[tokio::test]
    async fn test_panic_becomes_runtime_error() {
        let mut task = Task::new(Panics);
        task.invoke().await.unwrap();

        match task.exception() {
            Some(TaskError::Runtime(message)) => assert!(message.contains("worker exploded")),
            other => panic!("unexpected exception: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_callback_runs_once_per_outcome() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut ok = Task::new(Sum::new(vec![1, 2]));
        ok.set_callback(counting_callback(counter.clone()));
        ok.invoke().await.unwrap();

        let mut failed = Task::new(Fail::new("x"));
        failed.set_callback(counting_callback(counter.clone()));
        failed.invoke().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(ok.invoke().await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_defaults() {
        let task = Task::new(Echo::new("hi"));
        assert_eq!(task.channel(), DEFAULT_CHANNEL);

        let task = Task::new(Echo::new("hi")).with_channel("mail");
        assert_eq!(task.channel(), "mail");
    }

    #[tokio::test]
    async fn test_record_round_trip_excludes_transient_fields() {
        let registry = JobRegistry::with_builtin_jobs();
        let mut task = Task::new(Sum::new(vec![2, 3]))
            .with_id("41")
            .with_channel("math")
            .with_timeout(30)
            .with_requeue_on_timeout(false);
        task.invoke().await.unwrap();

        let input = task.to_input_record().unwrap();
        assert!(input.exception.is_none());
        assert!(input.log.is_empty());

        let restored = Task::from_record(input, &registry).unwrap();
        assert_eq!(restored.id(), Some(&TaskId::from("41")));
        assert_eq!(restored.channel(), "math");
        assert_eq!(restored.schedule(), task.schedule());
        assert!(!restored.is_invoked());
        assert_eq!(restored.job::<Sum>().unwrap().total, Some(5));
    }
}
