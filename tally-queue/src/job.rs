//! Job records and options.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{Backoff, TallyResult};

/// Per-job delivery options.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Wait before the job becomes runnable.
    pub delay: Duration,
    /// Caller-chosen id. A job whose id is already waiting, delayed or
    /// active is rejected as a duplicate.
    pub job_id: Option<String>,
    /// Forget the job once it completes instead of keeping it in the
    /// completed list.
    pub remove_on_complete: bool,
    /// Total attempts before the job is moved to `failed`.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            job_id: None,
            remove_on_complete: false,
            attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn with_retries(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.attempts = attempts;
        self.backoff = backoff;
        self
    }
}

/// A job ready to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub payload: Value,
    pub opts: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: Value, opts: JobOptions) -> Self {
        Self {
            name: name.into(),
            payload,
            opts,
        }
    }
}

/// A job as seen by its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub opts: JobOptions,
    /// Attempts finished before the current one.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Schedule for a repeating job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatOptions {
    pub every: Duration,
    /// Stop after this many firings. `None` repeats until the queue closes.
    pub limit: Option<u32>,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    /// A job with this id was already waiting, delayed or active.
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued(_))
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// No job is waiting, delayed or running.
    pub fn is_idle(&self) -> bool {
        self.waiting == 0 && self.delayed == 0 && self.active == 0
    }
}

/// A job that used up all its attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub job: Job,
    pub reason: String,
}

/// Processes jobs of one name.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> TallyResult<()>;
}
