//! Store adapter used by the queue pool.
//!
//! The pool only talks to the store through the [`Store`] trait. Two
//! implementations ship with the crate:
//!
//! - [`RedisStore`]: production backend on a Redis-compatible server
//! - [`MemoryStore`]: in-process backend for tests and single-process setups
//!
//! Multi-key updates are expressed as a [`Transaction`] of [`StoreOp`]s that
//! the backend applies atomically.

#[cfg(test)]
mod flaky;
mod memory;
mod redis_store;

#[cfg(test)]
pub(crate) use self::flaky::FlakyStore;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors that can occur in a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backend.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key holds a value of the wrong type for the operation.
    #[error("Wrong type for key '{0}'")]
    WrongType(String),
}

/// Condition applied to a sorted set insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddCondition {
    /// Insert or update.
    Always,
    /// Insert only when the member is absent (`NX`).
    IfAbsent,
    /// Update only when the member is present (`XX`).
    IfPresent,
}

/// A single operation queued in a [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Publish { topic: String, payload: Vec<u8> },
    SetAdd { key: String, member: String },
    ListPush { key: String, values: Vec<Vec<u8>> },
    Incr { key: String },
    SetEx { key: String, value: Vec<u8>, ttl: Duration },
    Delete { keys: Vec<String> },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    Expire { key: String, ttl: Duration },
}

/// Ordered batch of operations executed as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(StoreOp::Publish {
            topic: topic.into(),
            payload: payload.into(),
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn rpush(&mut self, key: impl Into<String>, values: Vec<Vec<u8>>) -> &mut Self {
        self.ops.push(StoreOp::ListPush {
            key: key.into(),
            values,
        });
        self
    }

    pub fn incr(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::Incr { key: key.into() });
        self
    }

    pub fn set_ex(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Duration) -> &mut Self {
        self.ops.push(StoreOp::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        self.ops.push(StoreOp::Delete { keys });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(StoreOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    /// Queued operations in execution order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A message delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw message body.
    pub payload: Vec<u8>,
}

/// Stream of messages; dropping it cancels the subscription.
pub type MessageStream = BoxStream<'static, Message>;

/// Primitives the queue pool needs from a shared store.
///
/// Values are raw bytes. Every blocking call carries its own timeout and
/// returns `None` when it elapses.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// Pops the head of the first non-empty list among `keys`, waiting up to
    /// `timeout`. Returns the key the value came from.
    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError>;

    /// Returns true when the member was inserted or its score changed.
    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        condition: ZAddCondition,
    ) -> Result<bool, StoreError>;

    /// Members with `score <= max`, lowest score first, at most `limit`.
    async fn zrangebyscore(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Members by rank, inclusive bounds; negative indexes count from the end.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    /// Returns true when the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Subscribes to the given topics.
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, StoreError>;

    /// Applies all operations atomically.
    async fn exec(&self, tx: Transaction) -> Result<(), StoreError>;
}
