//! Queue pool: the distributed queue protocol over a [`Store`](crate::store::Store).
//!
//! - [`QueuePool`]: async push, pop, complete and wait
//! - [`BlockingQueuePool`]: the same protocol for synchronous callers
//! - [`Sweeper`]: periodic promotion of delayed tasks and requeue of timed-out ones
//!
//! # Example
//!
//! ```ignore
//! use taskpool::{JobRegistry, QueueConfig, QueuePool, Task};
//! use taskpool::jobs::Sum;
//!
//! let pool = QueuePool::connect(QueueConfig::from_env()?, JobRegistry::with_builtin_jobs()).await?;
//! let mut task = Task::new(Sum::new(vec![1, 2, 3])).with_channel("math");
//! pool.push(&mut task).await?;
//! let done = pool.wait(&task, Duration::from_secs(10)).await?;
//! ```

mod blocking;
mod events;
mod keys;
mod queue_pool;
mod sweeper;

pub use blocking::BlockingQueuePool;
pub use events::ChannelEvent;
pub use keys::KeySpace;
pub use queue_pool::{ChannelStats, PushOutcome, QueuePool};
pub use sweeper::{SweepReport, Sweeper};
