//! Job trait: the typed body of a task.
//!
//! A job kind is a serializable struct implementing [`Job`]. The pool stores
//! jobs type-erased as `Box<dyn DynJob>`; every `Job` is a `DynJob` through a
//! blanket impl, so job authors never implement `DynJob` themselves.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Resize {
//!     path: String,
//!     width: u32,
//! }
//!
//! #[async_trait]
//! impl Job for Resize {
//!     const KIND: &'static str = "resize";
//!
//!     async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
//!         ctx.log(format!("resizing {}", self.path));
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::TaskId;
use crate::error::TaskError;

/// Execution context handed to job hooks.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    task_id: Option<TaskId>,
    channel: String,
    lines: Vec<String>,
}

impl JobContext {
    pub fn new(task_id: Option<TaskId>, channel: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            task_id,
            channel: channel.into(),
            lines,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Appends a line to the task's execution log.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(task_id = ?self.task_id, line = %line, "Task log");
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// A kind of work a task can carry.
///
/// Only [`execute`](Job::execute) is required. Errors returned from
/// `before`/`execute` fail the task; returning a [`TaskError`] records it
/// unchanged, any other error is wrapped as a runtime failure.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry key of this job kind.
    const KIND: &'static str;

    /// Channel used when the task does not name one.
    fn default_channel(&self) -> Option<&str> {
        None
    }

    /// Runs at push time, before the job is serialized.
    fn before_enqueue(&mut self) {}

    async fn before(&mut self, _ctx: &mut JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()>;

    async fn after(&mut self, _ctx: &mut JobContext) {}

    async fn on_exception(&mut self, _error: &TaskError, _ctx: &mut JobContext) {}
}

/// Object-safe view of a [`Job`].
#[async_trait]
pub trait DynJob: Send + Sync {
    fn kind(&self) -> &'static str;

    fn default_channel(&self) -> Option<&str>;

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn before_enqueue(&mut self);

    async fn before(&mut self, ctx: &mut JobContext) -> anyhow::Result<()>;

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()>;

    async fn after(&mut self, ctx: &mut JobContext);

    async fn on_exception(&mut self, error: &TaskError, ctx: &mut JobContext);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[async_trait]
impl<J: Job> DynJob for J {
    fn kind(&self) -> &'static str {
        J::KIND
    }

    fn default_channel(&self) -> Option<&str> {
        Job::default_channel(self)
    }

    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn before_enqueue(&mut self) {
        Job::before_enqueue(self)
    }

    async fn before(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        Job::before(self, ctx).await
    }

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        Job::execute(self, ctx).await
    }

    async fn after(&mut self, ctx: &mut JobContext) {
        Job::after(self, ctx).await
    }

    async fn on_exception(&mut self, error: &TaskError, ctx: &mut JobContext) {
        Job::on_exception(self, error, ctx).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
