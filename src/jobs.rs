//! Job kinds shipped with the crate.
//!
//! Small, dependency-free jobs useful for smoke-testing a deployment from
//! the command line and for exercising workers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::task::{Job, JobContext, JobRegistry};

/// Adds every built-in kind to `registry`.
pub(crate) fn builtin(registry: JobRegistry) -> JobRegistry {
    registry
        .with_job::<Echo>()
        .with_job::<Sum>()
        .with_job::<Sleep>()
        .with_job::<Fail>()
}

/// Replies with its message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl Echo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reply: None,
        }
    }
}

#[async_trait]
impl Job for Echo {
    const KIND: &'static str = "echo";

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        ctx.log(format!("echo: {}", self.message));
        self.reply = Some(self.message.clone());
        Ok(())
    }
}

/// Adds up integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    #[serde(default)]
    pub values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

impl Sum {
    pub fn new(values: Vec<i64>) -> Self {
        Self { values, total: None }
    }
}

#[async_trait]
impl Job for Sum {
    const KIND: &'static str = "sum";

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        let total = self
            .values
            .iter()
            .try_fold(0i64, |acc, v| acc.checked_add(*v))
            .ok_or_else(|| TaskError::failed("sum overflowed i64"))?;
        ctx.log(format!("sum of {} values = {}", self.values.len(), total));
        self.total = Some(total);
        Ok(())
    }
}

/// Sleeps, then succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    #[serde(default)]
    pub millis: u64,
}

#[async_trait]
impl Job for Sleep {
    const KIND: &'static str = "sleep";

    async fn execute(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        ctx.log(format!("slept {}ms", self.millis));
        Ok(())
    }
}

/// Always fails with its message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fail {
    #[serde(default)]
    pub message: String,
}

impl Fail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Job for Fail {
    const KIND: &'static str = "fail";

    async fn execute(&mut self, _ctx: &mut JobContext) -> anyhow::Result<()> {
        Err(TaskError::failed(self.message.clone()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[tokio::test]
    async fn test_echo_replies() {
        let mut task = Task::new(Echo::new("ping"));
        task.invoke().await.unwrap();
        assert_eq!(task.job::<Echo>().unwrap().reply.as_deref(), Some("ping"));
        assert_eq!(task.log_lines(), ["echo: ping".to_string()]);
    }

    #[tokio::test]
    async fn test_sum_overflow_fails() {
        let mut task = Task::new(Sum::new(vec![i64::MAX, 1]));
        task.invoke().await.unwrap();
        assert_eq!(
            task.exception(),
            Some(&TaskError::Failed("sum overflowed i64".to_string()))
        );
    }

    #[tokio::test]
    async fn test_sleep_succeeds() {
        let mut task = Task::new(Sleep { millis: 1 });
        task.invoke().await.unwrap();
        assert!(!task.has_exception());
    }
}
