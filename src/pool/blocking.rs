//! Synchronous facade over [`QueuePool`].
//!
//! Each call drives the async protocol to completion on a private
//! current-thread runtime, so synchronous programs share one protocol
//! implementation with async ones. Must not be called from inside an async
//! runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use super::queue_pool::{ChannelStats, PushOutcome, QueuePool};
use super::sweeper::SweepReport;
use crate::config::QueueConfig;
use crate::error::{QueueError, TaskError};
use crate::store::Store;
use crate::task::{JobRegistry, Task, TaskCollection};

/// Blocking queue pool.
pub struct BlockingQueuePool {
    inner: QueuePool,
    runtime: Runtime,
}

impl BlockingQueuePool {
    /// Wraps an existing async pool.
    pub fn new(inner: QueuePool) -> Result<Self, QueueError> {
        Ok(Self {
            inner,
            runtime: build_runtime()?,
        })
    }

    /// Blocking pool over an existing store.
    pub fn with_store(
        store: Arc<dyn Store>,
        registry: JobRegistry,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        Self::new(QueuePool::new(store, registry, config))
    }

    /// Connects to the Redis server named in `config`.
    pub fn connect(config: QueueConfig, registry: JobRegistry) -> Result<Self, QueueError> {
        let runtime = build_runtime()?;
        let inner = runtime.block_on(QueuePool::connect(config, registry))?;
        Ok(Self { inner, runtime })
    }

    /// The async pool this facade drives.
    pub fn inner(&self) -> &QueuePool {
        &self.inner
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn push(&self, task: &mut Task) -> Result<PushOutcome, QueueError> {
        self.runtime.block_on(self.inner.push(task))
    }

    pub fn push_wait(&self, task: &mut Task, timeout: Duration) -> Result<Task, QueueError> {
        self.runtime.block_on(self.inner.push_wait(task, timeout))
    }

    pub fn pop(&self, channels: Option<&[String]>) -> Result<Option<Task>, QueueError> {
        self.runtime.block_on(self.inner.pop(channels))
    }

    pub fn complete(&self, task: &Task) -> Result<(), QueueError> {
        self.runtime.block_on(self.inner.complete(task))
    }

    pub fn wait(&self, task: &Task, timeout: Duration) -> Result<Task, QueueError> {
        self.runtime.block_on(self.inner.wait(task, timeout))
    }

    pub fn wait_collection(
        &self,
        collection: &mut TaskCollection,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.runtime
            .block_on(self.inner.wait_collection(collection, timeout))
    }

    /// Invokes a task on this thread. The task's callback, if any, runs
    /// before this returns.
    pub fn invoke(&self, task: &mut Task) -> Result<(), TaskError> {
        self.runtime.block_on(task.invoke())
    }

    /// Invokes a popped task and completes it through the pool.
    pub fn run_task(&self, task: &mut Task) -> Result<(), QueueError> {
        task.set_callback(self.inner.completion_callback());
        Ok(self.invoke(task)?)
    }

    pub fn list_channels(&self) -> Result<Vec<String>, QueueError> {
        self.runtime.block_on(self.inner.list_channels())
    }

    pub fn channel_stats(&self, channel: &str) -> Result<ChannelStats, QueueError> {
        self.runtime.block_on(self.inner.channel_stats(channel))
    }

    pub fn pending_tasks(
        &self,
        channel: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Task>, QueueError> {
        self.runtime
            .block_on(self.inner.pending_tasks(channel, start, stop))
    }

    pub fn update_timeouts(&self, tasks: &[&Task]) -> Result<usize, QueueError> {
        self.runtime.block_on(self.inner.update_timeouts(tasks))
    }

    pub fn set_progress(&self, task: &Task, progress: &str) -> Result<(), QueueError> {
        self.runtime.block_on(self.inner.set_progress(task, progress))
    }

    pub fn sweep_channel(&self, channel: &str) -> Result<SweepReport, QueueError> {
        self.runtime.block_on(self.inner.sweep_channel(channel))
    }

    pub fn sweep_all(&self) -> Result<SweepReport, QueueError> {
        self.runtime.block_on(self.inner.sweep_all())
    }
}

impl std::fmt::Debug for BlockingQueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingQueuePool")
            .field("inner", &self.inner)
            .finish()
    }
}

fn build_runtime() -> Result<Runtime, QueueError> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| QueueError::Runtime(e.to_string()))
}
