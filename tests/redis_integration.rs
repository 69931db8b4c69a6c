//! Integration tests against a real Redis server.
//!
//! Each test uses its own key prefix so runs do not interfere.
//! Run with: TASKPOOL_REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::time::Duration;

use futures::StreamExt;
use taskpool::jobs::{Echo, Fail, Sum};
use taskpool::{
    BlockingQueuePool, ChannelEvent, JobRegistry, PushOutcome, QueueConfig, QueueError, QueuePool,
    Task, TaskCollection, TaskError, WorkerPool, WorkerPoolConfig,
};

fn redis_url() -> String {
    std::env::var("TASKPOOL_REDIS_URL")
        .expect("TASKPOOL_REDIS_URL environment variable must be set for integration tests")
}

fn test_config(name: &str) -> QueueConfig {
    QueueConfig::default()
        .with_redis_url(redis_url())
        .with_prefix(format!("taskpool-test-{}-{}", name, uuid::Uuid::new_v4().simple()))
}

async fn connect(name: &str) -> QueuePool {
    QueuePool::connect(test_config(name), JobRegistry::with_builtin_jobs())
        .await
        .expect("Should connect to Redis")
}

async fn run_one(pool: &QueuePool, channel: &str) {
    let channels = vec![channel.to_string()];
    let mut task = pool
        .pop(Some(&channels))
        .await
        .expect("Pop should succeed")
        .expect("A task should be ready");
    task.set_callback(pool.completion_callback());
    task.invoke().await.expect("Fresh task should be invocable");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_push_pop_complete_wait() {
    let pool = connect("basic").await;

    let mut task = Task::new(Sum::new(vec![1, 2, 3])).with_channel("x");
    assert_eq!(pool.push(&mut task).await.unwrap(), PushOutcome::Enqueued);
    run_one(&pool, "x").await;

    let resolved = pool.wait(&task, Duration::from_secs(3)).await.unwrap();
    assert!(!resolved.has_exception());
    assert_eq!(resolved.job::<Sum>().unwrap().total, Some(6));

    let stats = pool.channel_stats("x").await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.backlog, 0);
}

#[tokio::test]
#[ignore]
async fn test_duplicate_id_is_ignored() {
    let pool = connect("dup").await;

    let mut first = Task::new(Echo::new("c")).with_id("c").with_channel("x").with_delay(10);
    let mut second = Task::new(Echo::new("c")).with_id("c").with_channel("x").with_delay(10);
    assert_eq!(pool.push(&mut first).await.unwrap(), PushOutcome::Delayed);
    assert_eq!(pool.push(&mut second).await.unwrap(), PushOutcome::Duplicate);
    assert_eq!(pool.channel_stats("x").await.unwrap().total, 1);
}

#[tokio::test]
#[ignore]
async fn test_delayed_task_is_promoted() {
    let pool = connect("delay").await;

    let mut task = Task::new(Echo::new("later")).with_channel("x").with_delay(1);
    pool.push(&mut task).await.unwrap();
    assert_eq!(pool.channel_stats("x").await.unwrap().backlog, 0);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(pool.sweep_channel("x").await.unwrap().promoted, 1);
    run_one(&pool, "x").await;
    assert!(pool.wait(&task, Duration::from_secs(3)).await.is_ok());
}

#[tokio::test]
#[ignore]
async fn test_timed_out_task_is_requeued() {
    let pool = connect("timeout").await;

    let mut task = Task::new(Echo::new("b")).with_id("b").with_channel("x").with_timeout(1);
    pool.push(&mut task).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(pool.sweep_channel("x").await.unwrap().requeued, 1);
    assert_eq!(pool.channel_stats("x").await.unwrap().backlog, 2);
}

#[tokio::test]
#[ignore]
async fn test_wait_timeout_and_collection() {
    let pool = connect("collection").await;

    let mut ok = Task::new(Echo::new("ok")).with_channel("x");
    let mut bad = Task::new(Fail::new("bad")).with_channel("x");
    pool.push(&mut ok).await.unwrap();
    pool.push(&mut bad).await.unwrap();

    let err = pool.wait(&ok, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, QueueError::WaitTimeout(_)));

    run_one(&pool, "x").await;
    run_one(&pool, "x").await;

    let mut collection: TaskCollection = [&ok, &bad]
        .iter()
        .map(|t| Task::new(Echo::new("")).with_id(t.id().unwrap().clone()))
        .collect();
    while !collection.is_resolved() {
        pool.wait_collection(&mut collection, Duration::from_secs(3))
            .await
            .unwrap();
    }
    assert_eq!(collection.successful().count(), 1);
    assert!(matches!(
        collection.failed().next().unwrap().exception(),
        Some(TaskError::Failed(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_channel_events() {
    let pool = connect("events").await;
    let mut events = pool.subscribe("x").await.unwrap();
    // Let the subscription register before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut task = Task::new(Echo::new("e")).with_channel("x");
    pool.push(&mut task).await.unwrap();
    run_one(&pool, "x").await;

    let first = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ChannelEvent::New { .. }));
    assert!(matches!(second, ChannelEvent::Complete { .. }));
}

#[tokio::test]
#[ignore]
async fn test_worker_pool_drains_channel() {
    let pool = connect("workers").await;

    let mut tasks: Vec<Task> = (0..5)
        .map(|i| Task::new(Sum::new(vec![i, i])).with_channel("w"))
        .collect();
    for task in tasks.iter_mut() {
        pool.push(task).await.unwrap();
    }

    let mut workers = WorkerPool::new(WorkerPoolConfig::new(3), pool.clone());
    workers.start().unwrap();
    for task in &tasks {
        pool.wait(task, Duration::from_secs(5)).await.unwrap();
    }
    workers.shutdown().await.unwrap();
    assert_eq!(workers.stats().tasks_completed, 5);
}

#[test]
#[ignore]
fn test_blocking_pool_round_trip() {
    let pool = BlockingQueuePool::connect(test_config("blocking"), JobRegistry::with_builtin_jobs())
        .expect("Should connect to Redis");

    let mut task = Task::new(Echo::new("sync")).with_channel("s");
    pool.push(&mut task).unwrap();

    let channels = vec!["s".to_string()];
    let mut popped = pool.pop(Some(&channels)).unwrap().expect("A task should be ready");
    pool.run_task(&mut popped).unwrap();

    let resolved = pool.wait(&task, Duration::from_secs(3)).unwrap();
    assert_eq!(resolved.job::<Echo>().unwrap().reply.as_deref(), Some("sync"));
}
