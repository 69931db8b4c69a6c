//! Test store: a [`MemoryStore`] that records transactions and can be told
//! to fail the next ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{MemoryStore, MessageStream, Store, StoreError, StoreOp, Transaction, ZAddCondition};

#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failing_execs: AtomicUsize,
    executed: Mutex<Vec<Transaction>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `exec` fail without applying anything.
    pub(crate) fn fail_execs(&self, count: usize) {
        self.failing_execs.store(count, Ordering::SeqCst);
    }

    /// Every op of the transactions applied so far.
    pub(crate) fn executed_ops(&self) -> Vec<StoreOp> {
        self.executed
            .lock()
            .map(|txs| txs.iter().flat_map(|tx| tx.ops().to_vec()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.inner.mget(keys).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.inner.incr(key).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        self.inner.blpop(keys, timeout).await
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        condition: ZAddCondition,
    ) -> Result<bool, StoreError> {
        self.inner.zadd(key, member, score, condition).await
    }

    async fn zrangebyscore(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, StoreError> {
        self.inner.zrangebyscore(key, max, limit).await
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.inner.zrange(key, start, stop).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, StoreError> {
        self.inner.subscribe(topics).await
    }

    async fn exec(&self, tx: Transaction) -> Result<(), StoreError> {
        let failing = self
            .failing_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::ConnectionFailed("connection reset".to_string()));
        }
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(tx.clone());
        }
        self.inner.exec(tx).await
    }
}
