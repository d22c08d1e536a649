//! Tally Queue - Background Job Queue
//!
//! The [`JobQueue`] contract covers what reconciliation needs from a job
//! system: id-deduplicated enqueue, bulk enqueue, repeating schedules and
//! named processors with bounded concurrency and retry with backoff.
//!
//! [`InMemoryJobQueue`] implements it on tokio tasks. Clones share one
//! queue, so several engines in one process see the same jobs.
//! [`RedisJobQueue`] keeps the jobs in Redis so engines in different
//! processes share them.

pub mod job;
pub mod memory;
pub mod redis;

pub use job::{
    EnqueueOutcome, FailedJob, Job, JobHandler, JobOptions, NewJob, QueueCounts, RepeatOptions,
};
pub use self::memory::InMemoryJobQueue;
pub use self::redis::{RedisJobQueue, RedisQueueConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::QueueError;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Job queue trait for pluggable queue backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add one job.
    async fn enqueue(&self, name: &str, payload: Value, opts: JobOptions)
        -> QueueResult<EnqueueOutcome>;

    /// Add several jobs. Outcomes are in input order.
    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<EnqueueOutcome>>;

    /// Enqueue `name` every `repeat.every`. Scheduling the same name again
    /// replaces the earlier schedule.
    async fn schedule_repeating(
        &self,
        name: &str,
        payload: Value,
        repeat: RepeatOptions,
    ) -> QueueResult<()>;

    /// Start consuming jobs named `name` with at most `concurrency` running
    /// at once.
    async fn register_processor(
        &self,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()>;

    async fn counts(&self) -> QueueCounts;

    /// Stop schedules and processors. Running jobs finish; nothing new
    /// starts and further enqueues fail with [`QueueError::Closed`].
    async fn close(&self);
}
