//! taskpool: distributed task queue over Redis.
//!
//! Producers push [`Task`]s onto named channels, workers pop and run them,
//! and any process can wait for a task's result. Delayed tasks and
//! completion deadlines are tracked in a per-channel pending index that a
//! [`Sweeper`] periodically scans.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod store;
pub mod task;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, RegistryError, TaskError};
pub use pool::{
    BlockingQueuePool, ChannelEvent, ChannelStats, PushOutcome, QueuePool, SweepReport, Sweeper,
};
pub use store::{MemoryStore, RedisStore, Store, StoreError};
pub use task::{
    Job, JobContext, JobRegistry, Schedule, Task, TaskCollection, TaskId, TaskRecord,
};
pub use worker::{BlockingWorker, PoolStats, WorkerError, WorkerPool, WorkerPoolConfig};
