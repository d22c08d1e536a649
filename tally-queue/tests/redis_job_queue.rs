//! Redis job queue tests.
//!
//! Run with `--features redis-tests` against the server named by
//! `TALLY_REDIS_URL` (default `redis://127.0.0.1:6379/15`). Each test uses
//! its own key prefix.

#![cfg(feature = "redis-tests")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{Backoff, TallyError, TallyResult};
use tally_queue::{
    EnqueueOutcome, Job, JobHandler, JobOptions, JobQueue, RedisJobQueue, RedisQueueConfig,
    RepeatOptions,
};

/// Two queues on separate connections with one prefix, standing in for
/// two processes.
async fn queue_pair() -> (RedisJobQueue, RedisJobQueue) {
    let url = std::env::var("TALLY_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let client = redis::Client::open(url).expect("redis url");
    let config = RedisQueueConfig {
        prefix: format!("tally-test:{}", uuid::Uuid::now_v7()),
        poll_interval: Duration::from_millis(10),
        ..RedisQueueConfig::default()
    };
    let first = redis::aio::ConnectionManager::new(client.clone())
        .await
        .expect("redis");
    let second = redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis");
    (
        RedisJobQueue::new(first, config.clone()),
        RedisJobQueue::new(second, config),
    )
}

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for Counting {
    async fn handle(&self, _job: &Job) -> TallyResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn handle(&self, _job: &Job) -> TallyResult<()> {
        Err(TallyError::InvalidJob {
            reason: "boom".to_string(),
        })
    }
}

#[tokio::test]
async fn test_ids_deduplicate_across_processes() {
    let (a, b) = queue_pair().await;
    let opts = JobOptions::default().with_job_id("item-a");

    let first = a.enqueue("work", Value::Null, opts.clone()).await.unwrap();
    let second = b.enqueue("work", Value::Null, opts).await.unwrap();
    assert_eq!(first, EnqueueOutcome::Queued("item-a".to_string()));
    assert_eq!(second, EnqueueOutcome::Duplicate("item-a".to_string()));
    assert_eq!(b.pending_ids("work").await.unwrap(), vec!["item-a"]);
    assert_eq!(a.counts().await.waiting, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_enqueued_elsewhere_runs_once() {
    let (a, b) = queue_pair().await;
    let on_a = Arc::new(Counting::default());
    let on_b = Arc::new(Counting::default());
    a.register_processor("work", 2, on_a.clone()).await.unwrap();
    b.register_processor("work", 2, on_b.clone()).await.unwrap();

    for id in ["x", "y", "z"] {
        a.enqueue("work", Value::Null, JobOptions::default().with_job_id(id))
            .await
            .unwrap();
    }

    let total = || on_a.calls.load(Ordering::SeqCst) + on_b.calls.load(Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), async {
        while total() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs ran within five seconds");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(total(), 3);
    assert_eq!(a.counts().await.completed, 3);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_job_retried_then_failed() {
    let (a, _) = queue_pair().await;
    a.register_processor("work", 1, Arc::new(AlwaysFails))
        .await
        .unwrap();
    a.enqueue(
        "work",
        Value::Null,
        JobOptions::default()
            .with_job_id("doomed")
            .with_retries(2, Backoff::Fixed(Duration::from_millis(10))),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while a.failed_jobs().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job failed within five seconds");

    let failed = a.failed_jobs().await.unwrap();
    assert_eq!(failed[0].job.id, "doomed");
    assert_eq!(failed[0].job.attempts_made, 2);
    assert!(failed[0].reason.contains("boom"));

    // The id is free again once the job has left the queue.
    let again = a
        .enqueue("other", Value::Null, JobOptions::default().with_job_id("doomed"))
        .await
        .unwrap();
    assert!(again.is_queued());
    a.close().await;
}

#[tokio::test]
async fn test_delayed_job_counts_as_delayed() {
    let (a, _) = queue_pair().await;
    a.enqueue(
        "work",
        Value::Null,
        JobOptions::default().with_delay(Duration::from_secs(30)),
    )
    .await
    .unwrap();

    let counts = a.counts().await;
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.delayed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_schedule_fires_once_per_period() {
    let (a, b) = queue_pair().await;
    let repeat = RepeatOptions {
        every: Duration::from_secs(2),
        limit: Some(1),
    };
    a.schedule_repeating("tick", Value::Null, repeat).await.unwrap();
    b.schedule_repeating("tick", Value::Null, repeat).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = a.pending_ids("tick").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].starts_with("repeat:tick:"));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_closed_queue_rejects_enqueue() {
    let (a, _) = queue_pair().await;
    a.close().await;
    assert!(a
        .enqueue("work", Value::Null, JobOptions::default())
        .await
        .is_err());
}
