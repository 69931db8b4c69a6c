//! Channel events and task progress over pub/sub.

use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use super::keys::KeySpace;
use super::queue_pool::QueuePool;
use crate::error::QueueError;
use crate::store::Message;
use crate::task::{Task, TaskRecord};

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A task was pushed.
    New { channel: String, record: TaskRecord },
    /// A task completed, successfully or not.
    Complete { channel: String, record: TaskRecord },
}

impl ChannelEvent {
    pub fn channel(&self) -> &str {
        match self {
            Self::New { channel, .. } | Self::Complete { channel, .. } => channel,
        }
    }

    pub fn record(&self) -> &TaskRecord {
        match self {
            Self::New { record, .. } | Self::Complete { record, .. } => record,
        }
    }

    fn from_message(keys: &KeySpace, message: &Message) -> Option<Self> {
        let (topic_type, channel) = keys.split_topic(&message.topic)?;
        let record = TaskRecord::from_slice(&message.payload).ok()?;
        let channel = channel.to_string();
        match topic_type {
            "enqueue-channel" => Some(Self::New { channel, record }),
            "complete-channel" => Some(Self::Complete { channel, record }),
            _ => None,
        }
    }
}

impl QueuePool {
    /// Streams push and completion events of a channel.
    ///
    /// Messages that do not decode are skipped. Dropping the stream ends the
    /// subscription.
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, ChannelEvent>, QueueError> {
        let topics = vec![
            self.keys.enqueue_topic(channel),
            self.keys.complete_topic(channel),
        ];
        let messages = self.store.subscribe(&topics).await?;
        let keys = self.keys.clone();
        debug!(channel, "Subscribed to channel events");

        Ok(messages
            .filter_map(move |message| future::ready(ChannelEvent::from_message(&keys, &message)))
            .boxed())
    }

    /// Publishes a progress note for a running task and pushes back its
    /// completion deadline.
    pub async fn set_progress(&self, task: &Task, progress: &str) -> Result<(), QueueError> {
        let id = task
            .id()
            .ok_or_else(|| QueueError::IncorrectState("cannot report progress without an id".into()))?;
        self.store
            .publish(&self.keys.progress_topic(id), progress.as_bytes())
            .await?;
        self.update_timeouts(&[task]).await?;
        Ok(())
    }

    /// Streams progress notes published for a task.
    pub async fn subscribe_progress(&self, task: &Task) -> Result<BoxStream<'static, String>, QueueError> {
        let id = task
            .id()
            .ok_or_else(|| QueueError::IncorrectState("cannot follow a task without an id".into()))?;
        let messages = self.store.subscribe(&[self.keys.progress_topic(id)]).await?;
        Ok(messages
            .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::QueueConfig;
    use crate::jobs::Echo;
    use crate::store::MemoryStore;
    use crate::task::JobRegistry;

    fn test_pool() -> QueuePool {
        QueuePool::new(
            Arc::new(MemoryStore::new()),
            JobRegistry::with_builtin_jobs(),
            QueueConfig::default().with_pop_timeout(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_channel_events_follow_task() {
        let pool = test_pool();
        let mut events = pool.subscribe("mail").await.unwrap();

        let mut task = Task::new(Echo::new("hello")).with_channel("mail");
        pool.push(&mut task).await.unwrap();
        let mut popped = pool.pop(None).await.unwrap().unwrap();
        popped.set_callback(pool.completion_callback());
        popped.invoke().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, ChannelEvent::New { .. }));
        assert!(matches!(second, ChannelEvent::Complete { .. }));
        assert_eq!(second.channel(), "mail");
        assert_eq!(second.record().id, task.id().cloned());
    }

    #[tokio::test]
    async fn test_progress_is_streamed() {
        let pool = test_pool();
        let task = Task::new(Echo::new("long")).with_id("p1");
        let mut progress = pool.subscribe_progress(&task).await.unwrap();

        pool.set_progress(&task, "50%").await.unwrap();
        let note = tokio::time::timeout(Duration::from_secs(1), progress.next())
            .await
            .unwrap();
        assert_eq!(note.as_deref(), Some("50%"));
    }

    #[tokio::test]
    async fn test_progress_requires_id() {
        let pool = test_pool();
        let task = Task::new(Echo::new("anon"));
        assert!(pool.set_progress(&task, "1").await.is_err());
    }
}
