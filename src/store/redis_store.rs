//! Redis store backend.
//!
//! Regular commands go through a shared [`ConnectionManager`], which handles
//! reconnection. Blocking pops borrow a dedicated connection from a small
//! stash, since a `BLPOP` on the shared multiplexed connection would hold up
//! every other command behind it. Subscriptions open their own connection.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tracing::{debug, warn};

use super::{Message, MessageStream, Store, StoreError, StoreOp, Transaction, ZAddCondition};

/// Store backed by a Redis-compatible server.
pub struct RedisStore {
    client: redis::Client,
    /// Shared connection (handles reconnection automatically).
    redis: ConnectionManager,
    /// Idle connections reserved for blocking commands.
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!(url = redis_url, "Connected to Redis");

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.blocking.lock().ok().and_then(|mut stash| stash.pop());
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_tokio_connection().await?),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        if let Ok(mut stash) = self.blocking.lock() {
            stash.push(conn);
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// `BLPOP` takes whole seconds; round up so a wait never ends early.
fn blpop_seconds(timeout: Duration) -> u64 {
    let whole = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    whole.max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<Option<Vec<u8>>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.redis.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        if keys.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let mut conn = self.checkout_blocking().await?;
        let result: Result<Option<(String, Vec<u8>)>, redis::RedisError> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(blpop_seconds(timeout))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(value) => {
                self.checkin_blocking(conn);
                Ok(value)
            }
            Err(e) => {
                // The connection may be mid-reply; drop it instead of reusing.
                warn!(error = %e, "Blocking pop failed");
                Err(e.into())
            }
        }
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        condition: ZAddCondition,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        match condition {
            ZAddCondition::Always => cmd.arg("CH"),
            ZAddCondition::IfAbsent => cmd.arg("NX"),
            ZAddCondition::IfPresent => cmd.arg("XX").arg("CH"),
        };
        let changed: i64 = cmd.arg(score).arg(member).query_async(&mut conn).await?;
        Ok(changed > 0)
    }

    async fn zrangebyscore(&self, key: &str, max: f64, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, StoreError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }

        let stream = pubsub.into_on_message().map(|msg| Message {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(stream.boxed())
    }

    async fn exec(&self, tx: Transaction) -> Result<(), StoreError> {
        if tx.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in tx.ops() {
            match op {
                StoreOp::Publish { topic, payload } => {
                    pipe.cmd("PUBLISH").arg(topic).arg(payload.as_slice()).ignore();
                }
                StoreOp::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                StoreOp::ListPush { key, values } => {
                    if values.is_empty() {
                        continue;
                    }
                    pipe.cmd("RPUSH").arg(key);
                    for value in values {
                        pipe.arg(value.as_slice());
                    }
                    pipe.ignore();
                }
                StoreOp::Incr { key } => {
                    pipe.cmd("INCR").arg(key).ignore();
                }
                StoreOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value.as_slice())
                        .arg("EX")
                        .arg(ttl_secs(*ttl))
                        .ignore();
                }
                StoreOp::Delete { keys } => {
                    if keys.is_empty() {
                        continue;
                    }
                    pipe.cmd("DEL").arg(keys).ignore();
                }
                StoreOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                StoreOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl)).ignore();
                }
            }
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blpop_seconds_rounds_up() {
        assert_eq!(blpop_seconds(Duration::from_millis(50)), 1);
        assert_eq!(blpop_seconds(Duration::from_secs(1)), 1);
        assert_eq!(blpop_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(blpop_seconds(Duration::ZERO), 1);
    }
}
