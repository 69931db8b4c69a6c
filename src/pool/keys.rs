//! Key layout.
//!
//! Every key and topic is `<prefix>:<name>[:<suffix>]`:
//!
//! | Key | Structure |
//! |---|---|
//! | `task-seq` | counter |
//! | `list-channels` | set |
//! | `channel:<ch>` | list of ready ids |
//! | `channel-total:<ch>` | counter |
//! | `channel-pending:<ch>` | sorted set, task id → deadline |
//! | `input:<id>` / `output:<id>` | value with TTL |
//! | `blpop:<id>` | list of completion sentinels |
//! | `enqueue-channel:<ch>` / `complete-channel:<ch>` / `progress:<id>` | topics |

use crate::task::TaskId;

/// Key names under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task_seq(&self) -> String {
        format!("{}:task-seq", self.prefix)
    }

    pub fn list_channels(&self) -> String {
        format!("{}:list-channels", self.prefix)
    }

    pub fn channel(&self, channel: &str) -> String {
        format!("{}:channel:{}", self.prefix, channel)
    }

    pub fn channel_total(&self, channel: &str) -> String {
        format!("{}:channel-total:{}", self.prefix, channel)
    }

    pub fn channel_pending(&self, channel: &str) -> String {
        format!("{}:channel-pending:{}", self.prefix, channel)
    }

    pub fn input(&self, id: &TaskId) -> String {
        format!("{}:input:{}", self.prefix, id)
    }

    pub fn output(&self, id: &TaskId) -> String {
        format!("{}:output:{}", self.prefix, id)
    }

    pub fn signal(&self, id: &TaskId) -> String {
        format!("{}:blpop:{}", self.prefix, id)
    }

    pub fn enqueue_topic(&self, channel: &str) -> String {
        format!("{}:enqueue-channel:{}", self.prefix, channel)
    }

    pub fn complete_topic(&self, channel: &str) -> String {
        format!("{}:complete-channel:{}", self.prefix, channel)
    }

    pub fn progress_topic(&self, id: &TaskId) -> String {
        format!("{}:progress:{}", self.prefix, id)
    }

    /// Channel name of a ready list key.
    pub fn channel_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(":channel:")
    }

    /// Splits a topic into its type and subject, e.g.
    /// `queue:complete-channel:mail` → `("complete-channel", "mail")`.
    pub fn split_topic<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str)> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .split_once(':')
    }
}
