//! Wire format of a task.
//!
//! The same record shape is stored under the input key (at push) and the
//! output key (at completion). Input records never carry an exception or log.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Identity of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

fn default_requeue() -> bool {
    true
}

/// Scheduling hints of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Seconds before the task becomes visible to workers.
    #[serde(default)]
    pub delay_seconds: u64,
    /// Whether a repeated delayed push may move an existing deadline.
    #[serde(default)]
    pub delay_overwrite: bool,
    /// Seconds a popped task may run before the sweep re-examines it.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Whether the sweep resubmits the task once its timeout passes.
    #[serde(default = "default_requeue")]
    pub requeue_on_timeout: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            delay_overwrite: false,
            timeout_seconds: 0,
            requeue_on_timeout: true,
        }
    }
}

impl Schedule {
    pub fn is_delayed(&self) -> bool {
        self.delay_seconds > 0
    }

    pub fn is_timeout_tracked(&self) -> bool {
        self.timeout_seconds > 0
    }
}

/// Serialized task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub channel: String,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

impl TaskRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults_requeue() {
        let schedule: Schedule = serde_json::from_str("{}").unwrap();
        assert!(schedule.requeue_on_timeout);
        assert!(!schedule.is_delayed());
        assert!(!schedule.is_timeout_tracked());
    }

    #[test]
    fn test_record_omits_empty_fields() {
        let record = TaskRecord {
            id: Some(TaskId::from(7_i64)),
            channel: "default".to_string(),
            kind: "echo".to_string(),
            payload: serde_json::json!({ "message": "hi" }),
            schedule: Schedule::default(),
            exception: None,
            log: Vec::new(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "7");
        assert!(value.get("exception").is_none());
        assert!(value.get("log").is_none());

        let parsed = TaskRecord::from_slice(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
