//! In-process store backend.
//!
//! Mirrors the Redis semantics the pool relies on: lazy key expiry,
//! multi-key blocking pops, conditional sorted set inserts and topic
//! subscriptions. A transaction is checked before it is applied, then runs
//! under one lock; a failing transaction leaves the state untouched.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;

use super::{Message, MessageStream, Store, StoreError, StoreOp, Transaction, ZAddCondition};

const EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct State {
    values: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, BTreeSet<String>>,
    expires: HashMap<String, Instant>,
}

impl State {
    fn expire_if_due(&mut self, key: &str) {
        let due = self
            .expires
            .get(key)
            .is_some_and(|at| *at <= Instant::now());
        if due {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
        self.lists.remove(key);
        self.zsets.remove(key);
        self.sets.remove(key);
        self.expires.remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
            || self.lists.contains_key(key)
            || self.zsets.contains_key(key)
            || self.sets.contains_key(key)
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.expire_if_due(key);
        self.values.get(key).cloned()
    }

    fn incr(&mut self, key: &str) -> Result<i64, StoreError> {
        self.expire_if_due(key);
        let current = match self.values.get(key) {
            Some(raw) => parse_counter(raw).ok_or_else(|| StoreError::WrongType(key.to_string()))?,
            None => 0,
        };
        let next = current + 1;
        self.values.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    fn lpop_first(&mut self, keys: &[String]) -> Option<(String, Vec<u8>)> {
        for key in keys {
            self.expire_if_due(key);
            let Some(list) = self.lists.get_mut(key) else {
                continue;
            };
            if let Some(value) = list.pop_front() {
                if list.is_empty() {
                    self.lists.remove(key);
                    self.expires.remove(key);
                }
                return Some((key.clone(), value));
            }
        }
        None
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64, condition: ZAddCondition) -> bool {
        self.expire_if_due(key);
        let zset = self.zsets.entry(key.to_string()).or_default();
        let existing = zset.get(member).copied();
        let changed = match (condition, existing) {
            (ZAddCondition::IfAbsent, Some(_)) | (ZAddCondition::IfPresent, None) => false,
            (_, Some(old)) => old != score,
            (_, None) => true,
        };
        let write = match condition {
            ZAddCondition::Always => true,
            ZAddCondition::IfAbsent => existing.is_none(),
            ZAddCondition::IfPresent => existing.is_some(),
        };
        if write {
            zset.insert(member.to_string(), score);
        }
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        changed
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        self.expire_if_due(key);
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    fn sorted_members(&mut self, key: &str) -> Vec<(String, f64)> {
        self.expire_if_due(key);
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    /// Fails when any op of `ops` would fail once applied in order.
    fn check(&mut self, ops: &[StoreOp]) -> Result<(), StoreError> {
        // key -> holds a counter or nothing at this point of the transaction
        let mut staged: HashMap<&str, bool> = HashMap::new();
        for op in ops {
            match op {
                StoreOp::Incr { key } => {
                    let counter = match staged.get(key.as_str()) {
                        Some(counter) => *counter,
                        None => self.get(key).map_or(true, |raw| parse_counter(&raw).is_some()),
                    };
                    if !counter {
                        return Err(StoreError::WrongType(key.clone()));
                    }
                    staged.insert(key, true);
                }
                StoreOp::SetEx { key, value, .. } => {
                    staged.insert(key, parse_counter(value).is_some());
                }
                StoreOp::Delete { keys } => {
                    for key in keys {
                        staged.insert(key, true);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: &StoreOp, published: &mut Vec<Message>) -> Result<bool, StoreError> {
        let mut pushed = false;
        match op {
            StoreOp::Publish { topic, payload } => published.push(Message {
                topic: topic.clone(),
                payload: payload.clone(),
            }),
            StoreOp::SetAdd { key, member } => {
                self.expire_if_due(key);
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            StoreOp::ListPush { key, values } => {
                self.expire_if_due(key);
                if !values.is_empty() {
                    self.lists
                        .entry(key.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                    pushed = true;
                }
            }
            StoreOp::Incr { key } => {
                self.incr(key)?;
            }
            StoreOp::SetEx { key, value, ttl } => {
                self.remove(key);
                self.values.insert(key.clone(), value.clone());
                self.expires.insert(key.clone(), Instant::now() + *ttl);
            }
            StoreOp::Delete { keys } => {
                for key in keys {
                    self.remove(key);
                }
            }
            StoreOp::ZAdd { key, member, score } => {
                self.zadd(key, member, *score, ZAddCondition::Always);
            }
            StoreOp::ZRem { key, member } => {
                self.zrem(key, member);
            }
            StoreOp::Expire { key, ttl } => {
                self.expire_if_due(key);
                if self.exists(key) {
                    self.expires.insert(key.clone(), Instant::now() + *ttl);
                }
            }
        }
        Ok(pushed)
    }
}

fn parse_counter(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Store kept entirely in process memory.
pub struct MemoryStore {
    state: Mutex<State>,
    /// Woken whenever a list receives values.
    pushed: Notify,
    events: broadcast::Sender<Message>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            pushed: Notify::new(),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(&self, messages: Vec<Message>) {
        for message in messages {
            // No subscribers is not an error.
            let _ = self.events.send(message);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state().get(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let mut state = self.state();
        Ok(keys.iter().map(|key| state.get(key)).collect())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.state().incr(key)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.expire_if_due(key);
        Ok(state.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let hit = self.state().lpop_first(keys);
            if hit.is_some() {
                return Ok(hit);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        condition: ZAddCondition,
    ) -> Result<bool, StoreError> {
        Ok(self.state().zadd(key, member, score, condition))
    }

    async fn zrangebyscore(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state()
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score <= max)
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let members = self.state().sorted_members(key);
        let len = members.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(members
            .into_iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.state().zrem(key, member))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state();
        state.expire_if_due(key);
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.broadcast(vec![Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }]);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, StoreError> {
        let topics: HashSet<String> = topics.iter().cloned().collect();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(message) if topics.contains(&message.topic) => Some(message),
                _ => None,
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }

    async fn exec(&self, tx: Transaction) -> Result<(), StoreError> {
        let mut published = Vec::new();
        let mut pushed = false;
        {
            let mut state = self.state();
            state.check(tx.ops())?;
            for op in tx.ops() {
                pushed |= state.apply(op, &mut published)?;
            }
        }
        if pushed {
            self.pushed.notify_waiters();
        }
        self.broadcast(published);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn test_incr_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("seq").await.unwrap(), 1);
        assert_eq!(store.incr("seq").await.unwrap(), 2);
        assert_eq!(store.get("seq").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_blpop_times_out_empty() {
        let store = MemoryStore::new();
        let hit = store
            .blpop(&[key("a")], Duration::from_millis(20))
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn test_blpop_takes_first_non_empty_key() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.rpush("b", vec![b"1".to_vec(), b"2".to_vec()]);
        store.exec(tx).await.unwrap();

        let hit = store
            .blpop(&[key("a"), key("b")], Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(hit, Some((key("b"), b"1".to_vec())));
        assert_eq!(store.llen("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop(&[key("q")], Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut tx = Transaction::new();
        tx.rpush("q", vec![b"x".to_vec()]);
        store.exec(tx).await.unwrap();

        let hit = waiter.await.unwrap().unwrap();
        assert_eq!(hit, Some((key("q"), b"x".to_vec())));
    }

    #[tokio::test]
    async fn test_zadd_conditions() {
        let store = MemoryStore::new();
        assert!(store.zadd("z", "a", 1.0, ZAddCondition::IfAbsent).await.unwrap());
        assert!(!store.zadd("z", "a", 5.0, ZAddCondition::IfAbsent).await.unwrap());
        assert!(!store.zadd("z", "b", 5.0, ZAddCondition::IfPresent).await.unwrap());
        assert!(store.zadd("z", "a", 3.0, ZAddCondition::IfPresent).await.unwrap());

        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec![key("a")]);
        assert!(store.zrangebyscore("z", 2.0, 10).await.unwrap().is_empty());
        assert_eq!(store.zrangebyscore("z", 3.0, 10).await.unwrap(), vec![key("a")]);
    }

    #[tokio::test]
    async fn test_zrange_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 9.0, ZAddCondition::Always).await.unwrap();
        store.zadd("z", "early", 1.0, ZAddCondition::Always).await.unwrap();
        store.zadd("z", "mid", 5.0, ZAddCondition::Always).await.unwrap();

        assert_eq!(
            store.zrange("z", 0, -1).await.unwrap(),
            vec![key("early"), key("mid"), key("late")]
        );
        assert_eq!(store.zrange("z", -1, -1).await.unwrap(), vec![key("late")]);
        assert_eq!(store.zrangebyscore("z", 10.0, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_ex_expires() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.set_ex("k", b"v".to_vec(), Duration::from_millis(10));
        store.exec(tx).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let store = MemoryStore::new();
        let mut setup = Transaction::new();
        setup.set_ex("name", b"not a number".to_vec(), Duration::from_secs(60));
        store.exec(setup).await.unwrap();

        let mut tx = Transaction::new();
        tx.rpush("q", vec![b"x".to_vec()])
            .sadd("s", "a")
            .incr("name");
        assert!(matches!(store.exec(tx).await, Err(StoreError::WrongType(_))));

        assert_eq!(store.llen("q").await.unwrap(), 0);
        assert!(store.smembers("s").await.unwrap().is_empty());
        assert_eq!(store.get("name").await.unwrap(), Some(b"not a number".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_check_follows_earlier_ops() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new();
        tx.set_ex("n", b"word".to_vec(), Duration::from_secs(60))
            .del(vec![key("n")])
            .incr("n");
        store.exec(tx).await.unwrap();
        assert_eq!(store.get("n").await.unwrap(), Some(b"1".to_vec()));

        let mut tx = Transaction::new();
        tx.set_ex("n", b"word".to_vec(), Duration::from_secs(60)).incr("n");
        assert!(store.exec(tx).await.is_err());
        assert_eq!(store.get("n").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_subscribe_filters_topics() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe(&[key("wanted")]).await.unwrap();

        store.publish("other", b"no").await.unwrap();
        store.publish("wanted", b"yes").await.unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message.topic, "wanted");
        assert_eq!(message.payload, b"yes".to_vec());
    }
}
