//! Workers that pop tasks from a queue pool and run them.
//!
//! [`WorkerPool`] runs a fixed number of async workers plus a
//! [`Sweeper`] on the current tokio runtime. [`BlockingWorker`] runs the same
//! loop on an OS thread through a [`BlockingQueuePool`].
//!
//! # Features
//!
//! - Configurable number of workers and channels
//! - Graceful shutdown with broadcast channel
//! - Completion through the task callback, whatever the outcome
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::pool::{BlockingQueuePool, QueuePool, Sweeper};
use crate::task::Task;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The queue pool failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A worker thread could not be started.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Channels to pop from; empty means every known channel.
    pub channels: Vec<String>,
    /// Whether the pool also runs a sweeper.
    pub run_sweeper: bool,
    /// Pause after a failed pop.
    pub error_backoff: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            channels: Vec::new(),
            run_sweeper: true,
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_sweeper(mut self, run_sweeper: bool) -> Self {
        self.run_sweeper = run_sweeper;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn channel_filter(&self) -> Option<Vec<String>> {
        (!self.channels.is_empty()).then(|| self.channels.clone())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently invoking a task.
    pub active_workers: usize,
    /// Tasks that finished without an exception.
    pub tasks_completed: u64,
    /// Tasks that finished with an exception.
    pub tasks_failed: u64,
    /// Average invocation duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, failed: bool, duration: Duration) {
        let counter = if failed {
            &self.tasks_failed
        } else {
            &self.tasks_completed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            average_task_duration: average,
        }
    }
}

/// Bookkeeping around one invocation: busy/idle, stats, metrics, logs.
async fn process_task(
    worker_id: &str,
    pool: &QueuePool,
    stats: &SharedPoolStats,
    metrics: &MetricsCollector,
    mut task: Task,
) {
    let task_id = task.id().cloned();
    let channel = task.channel().to_string();
    let started = Instant::now();

    debug!(worker_id, task_id = ?task_id, channel = %channel, kind = task.kind(), "Processing task");

    task.set_callback(pool.completion_callback());
    stats.increment_active();
    metrics.job_started();

    let invoked = task.invoke().await;
    let duration = started.elapsed();

    metrics.job_finished();
    stats.decrement_active();
    metrics.record_duration(&channel, duration.as_secs_f64());

    if let Err(e) = invoked {
        error!(worker_id, task_id = ?task_id, error = %e, "Popped task could not be invoked");
        return;
    }

    stats.record(task.has_exception(), duration);
    match task.exception() {
        None => debug!(
            worker_id,
            task_id = ?task_id,
            duration_ms = duration.as_millis(),
            "Task finished"
        ),
        Some(exception) => warn!(
            worker_id,
            task_id = ?task_id,
            error = %exception,
            "Task finished with exception"
        ),
    }
}

/// Worker pool that runs tasks from a queue pool.
pub struct WorkerPool {
    instance_id: String,
    config: WorkerPoolConfig,
    pool: QueuePool,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, pool: QueuePool) -> Self {
        // Only ever sent once.
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut instance_id = Uuid::new_v4().simple().to_string();
        instance_id.truncate(8);

        Self {
            instance_id,
            config,
            pool,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers, and the sweeper when enabled.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-worker-{}", self.instance_id, i),
                pool: self.pool.clone(),
                channels: self.config.channel_filter(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                error_backoff: self.config.error_backoff,
                stats: Arc::clone(&self.stats),
                metrics: self.metrics,
            };
            self.handles.push(tokio::spawn(worker.run()));
        }

        if self.config.run_sweeper {
            let sweeper = Sweeper::new(self.pool.clone());
            self.handles.push(sweeper.spawn(self.shutdown_tx.subscribe()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.set_active_workers(self.config.num_workers);
        info!(
            instance_id = %self.instance_id,
            num_workers = self.config.num_workers,
            channels = ?self.config.channels,
            sweeper = self.config.run_sweeper,
            "Worker pool started"
        );

        Ok(())
    }

    /// Signals every worker and waits for in-flight tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let handles = &mut self.handles;
        let shutdown_future = async {
            for handle in handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.set_active_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(WorkerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn pool(&self) -> &QueuePool {
        &self.pool
    }

    /// Short random id prefixed to this pool's worker ids.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// A single async worker.
struct Worker {
    id: String,
    pool: QueuePool,
    channels: Option<Vec<String>>,
    shutdown_rx: broadcast::Receiver<()>,
    error_backoff: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Polls and runs tasks until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.pool.pop(self.channels.as_deref()).await {
                Ok(Some(task)) => {
                    process_task(&self.id, &self.pool, &self.stats, &self.metrics, task).await;
                }
                // pop already waited out its timeout
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to pop task");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}

/// Worker for synchronous programs.
///
/// Runs on the calling thread, or on its own thread via
/// [`spawn`](Self::spawn), until its stop flag is raised.
pub struct BlockingWorker {
    id: String,
    pool: BlockingQueuePool,
    channels: Option<Vec<String>>,
    error_backoff: Duration,
    stop: Arc<AtomicBool>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl BlockingWorker {
    pub fn new(pool: BlockingQueuePool) -> Self {
        Self {
            id: "blocking-worker".to_string(),
            pool,
            channels: None,
            error_backoff: Duration::from_secs(1),
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = (!channels.is_empty()).then_some(channels);
        self
    }

    /// Flag that stops the loop once the current task is done.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn pool(&self) -> &BlockingQueuePool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(1)
    }

    /// Pops and runs at most one task. Returns whether a task ran.
    pub fn run_once(&self) -> Result<bool, QueueError> {
        let Some(task) = self.pool.pop(self.channels.as_deref())? else {
            return Ok(false);
        };
        let inner = self.pool.inner();
        self.pool.block_on(process_task(
            &self.id,
            inner,
            &self.stats,
            &self.metrics,
            task,
        ));
        Ok(true)
    }

    /// Runs tasks until the stop flag is raised.
    pub fn run(&self) {
        info!(worker_id = %self.id, "Worker started");

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once() {
                error!(worker_id = %self.id, error = %e, "Failed to pop task");
                thread::sleep(self.error_backoff);
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Moves the worker onto a named OS thread.
    pub fn spawn(self) -> Result<thread::JoinHandle<PoolStats>, WorkerError> {
        let handle = thread::Builder::new()
            .name(self.id.clone())
            .spawn(move || {
                self.run();
                self.stats()
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::jobs::{Echo, Fail, Sum};
    use crate::store::MemoryStore;
    use crate::task::JobRegistry;

    fn test_pool() -> QueuePool {
        QueuePool::new(
            Arc::new(MemoryStore::new()),
            JobRegistry::with_builtin_jobs(),
            QueueConfig::default().with_pop_timeout(Duration::from_millis(20)),
        )
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_channels(vec!["mail".to_string()])
            .with_sweeper(false)
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.channel_filter(), Some(vec!["mail".to_string()]));
        assert!(!config.run_sweeper);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(WorkerPoolConfig::default().channel_filter(), None);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            tasks_completed: 80,
            tasks_failed: 20,
            average_task_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(false, Duration::from_secs(10));
        stats.record(false, Duration::from_secs(20));
        stats.record(true, Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.tasks_completed, 2);
        assert_eq!(pool_stats.tasks_failed, 1);
        assert_eq!(pool_stats.active_workers, 1);
        // (10000 + 20000 + 5000) / 3
        assert_eq!(pool_stats.average_task_duration.as_millis(), 11666);
    }

    #[tokio::test]
    async fn test_worker_pool_runs_tasks() {
        let pool = test_pool();
        let mut tasks = vec![
            Task::new(Sum::new(vec![1, 2])).with_channel("a"),
            Task::new(Echo::new("hi")).with_channel("b"),
            Task::new(Fail::new("bad")).with_channel("a"),
        ];
        for task in tasks.iter_mut() {
            pool.push(task).await.unwrap();
        }

        let mut workers = WorkerPool::new(
            WorkerPoolConfig::new(2).with_sweeper(false),
            pool.clone(),
        );
        workers.start().unwrap();
        assert!(matches!(workers.start(), Err(WorkerError::AlreadyRunning)));

        for task in &tasks {
            pool.wait(task, Duration::from_secs(5)).await.unwrap();
        }
        workers.shutdown().await.unwrap();

        let stats = workers.stats();
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(workers.instance_id().len(), 8);
        assert!(!workers.is_running());
        assert!(matches!(workers.shutdown().await, Err(WorkerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_worker_pool_respects_channel_filter() {
        let pool = test_pool();
        let mut other = Task::new(Echo::new("skip")).with_channel("other");
        pool.push(&mut other).await.unwrap();

        let mut workers = WorkerPool::new(
            WorkerPoolConfig::new(1)
                .with_channels(vec!["mine".to_string()])
                .with_sweeper(false),
            pool.clone(),
        );
        workers.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        workers.shutdown().await.unwrap();

        assert_eq!(workers.stats().total_processed(), 0);
        assert_eq!(pool.channel_stats("other").await.unwrap().backlog, 1);
    }

    #[test]
    fn test_blocking_worker_runs_once() {
        let blocking = BlockingQueuePool::new(test_pool()).unwrap();
        let worker = BlockingWorker::new(blocking).with_channels(vec!["math".to_string()]);

        let mut task = Task::new(Sum::new(vec![20, 22])).with_channel("math");
        worker.pool().push(&mut task).unwrap();

        assert!(worker.run_once().unwrap());
        assert!(!worker.run_once().unwrap());

        let resolved = worker.pool().wait(&task, Duration::from_secs(1)).unwrap();
        assert_eq!(resolved.job::<Sum>().unwrap().total, Some(42));
        assert_eq!(worker.stats().tasks_completed, 1);
    }

    #[test]
    fn test_blocking_worker_thread_stops() {
        let blocking = BlockingQueuePool::new(test_pool()).unwrap();
        let worker = BlockingWorker::new(blocking).with_id("t1");
        let stop = worker.stop_handle();

        let handle = worker.spawn().unwrap();
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::SeqCst);

        let stats = handle.join().unwrap();
        assert_eq!(stats.total_processed(), 0);
    }
}
