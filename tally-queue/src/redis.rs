//! Job queue kept in Redis, shared by every process using the same prefix.
//!
//! Layout under `{prefix}`:
//!
//! - `job:{id}`: the job record as JSON. It exists from enqueue until the
//!   job completes or fails for good, which is what deduplicates ids.
//! - `pending:{name}`: sorted set of job ids scored by the wall-clock
//!   millisecond the job becomes runnable.
//! - `active:{name}`: sorted set of claimed ids scored by the moment the
//!   claim lapses. A lapsed claim goes back to `pending` on the next claim,
//!   so jobs held by a dead process are retried.
//! - `names`, `completed`, `completed-jobs` and `failed` for bookkeeping.
//!
//! Enqueue and claim run as Lua scripts, so two processes never claim the
//! same job. Dispatchers poll, and are woken early by local enqueues.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{Backoff, QueueError};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::job::{
    EnqueueOutcome, FailedJob, Job, JobHandler, JobOptions, NewJob, QueueCounts, RepeatOptions,
};
use crate::{JobQueue, QueueResult};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[4])
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local lapsed = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(lapsed) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], ARGV[1], id)
end
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ready > 0 then
    redis.call('ZREM', KEYS[1], ready[1])
    redis.call('ZADD', KEYS[2], ARGV[2], ready[1])
    return {1, ready[1]}
end
local nxt = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if #nxt > 0 then
    return {0, nxt[2]}
end
return {0, ''}
"#;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisQueueConfig {
    /// Namespace for every queue key. Processes sharing jobs share this.
    pub prefix: String,
    /// Longest a dispatcher sleeps before looking for new jobs.
    pub poll_interval: Duration,
    /// How long a claimed job may run before another process may take it.
    pub claim_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            prefix: "tally-queue".to_string(),
            poll_interval: Duration::from_millis(50),
            claim_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn pending(&self, name: &str) -> String {
        format!("{}:pending:{}", self.prefix, name)
    }

    fn active(&self, name: &str) -> String {
        format!("{}:active:{}", self.prefix, name)
    }

    fn names(&self) -> String {
        format!("{}:names", self.prefix)
    }

    fn ids(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    fn completed(&self) -> String {
        format!("{}:completed", self.prefix)
    }

    fn completed_jobs(&self) -> String {
        format!("{}:completed-jobs", self.prefix)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    /// Marker claimed by the one process that enqueues `name` for `slot`.
    fn repeat_slot(&self, name: &str, slot: i64) -> String {
        format!("{}:repeat:{}:{}", self.prefix, name, slot)
    }
}

// ============================================================================
// STORED RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum StoredBackoff {
    Fixed { ms: u64 },
    Exponential { ms: u64 },
}

impl From<Backoff> for StoredBackoff {
    fn from(backoff: Backoff) -> Self {
        match backoff {
            Backoff::Fixed(d) => StoredBackoff::Fixed {
                ms: d.as_millis() as u64,
            },
            Backoff::Exponential(d) => StoredBackoff::Exponential {
                ms: d.as_millis() as u64,
            },
        }
    }
}

impl From<StoredBackoff> for Backoff {
    fn from(stored: StoredBackoff) -> Self {
        match stored {
            StoredBackoff::Fixed { ms } => Backoff::Fixed(Duration::from_millis(ms)),
            StoredBackoff::Exponential { ms } => Backoff::Exponential(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredJob {
    id: String,
    name: String,
    payload: Value,
    delay_ms: u64,
    attempts: u32,
    attempts_made: u32,
    backoff: StoredBackoff,
    remove_on_complete: bool,
    enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl StoredJob {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            delay_ms: job.opts.delay.as_millis() as u64,
            attempts: job.opts.attempts,
            attempts_made: job.attempts_made,
            backoff: job.opts.backoff.into(),
            remove_on_complete: job.opts.remove_on_complete,
            enqueued_at: job.enqueued_at,
            reason: None,
        }
    }

    fn into_job(self) -> Job {
        Job {
            opts: JobOptions {
                delay: Duration::from_millis(self.delay_ms),
                job_id: Some(self.id.clone()),
                remove_on_complete: self.remove_on_complete,
                attempts: self.attempts,
                backoff: self.backoff.into(),
            },
            id: self.id,
            name: self.name,
            payload: self.payload,
            attempts_made: self.attempts_made,
            enqueued_at: self.enqueued_at,
        }
    }

    fn encode(&self) -> QueueResult<String> {
        serde_json::to_string(self).map_err(|e| QueueError::Backend {
            reason: format!("Cannot encode job {}: {}", self.id, e),
        })
    }
}

fn backend(err: RedisError) -> QueueError {
    tracing::error!(error = %err, "Redis queue command failed");
    QueueError::Backend {
        reason: err.to_string(),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct Inner {
    conn: ConnectionManager,
    keys: QueueKeys,
    config: RedisQueueConfig,
    enqueue: Script,
    claim: Script,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    processors: Mutex<HashSet<String>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    repeaters: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Inner {
    async fn push(&self, new: NewJob) -> QueueResult<EnqueueOutcome> {
        if new.opts.attempts == 0 {
            return Err(QueueError::InvalidOptions {
                reason: format!("job {} needs at least one attempt", new.name),
            });
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let mut conn = self.conn.clone();
        let id = match new.opts.job_id.clone() {
            Some(id) => id,
            None => {
                let seq: u64 = redis::cmd("INCR")
                    .arg(self.keys.ids())
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                seq.to_string()
            }
        };

        let ready_at = now_ms() + new.opts.delay.as_millis() as i64;
        let job = Job {
            id: id.clone(),
            name: new.name,
            payload: new.payload,
            opts: new.opts,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        };
        let record = StoredJob::from_job(&job).encode()?;

        let queued: i64 = self
            .enqueue
            .key(self.keys.job(&id))
            .key(self.keys.pending(&job.name))
            .key(self.keys.names())
            .arg(&id)
            .arg(record)
            .arg(ready_at)
            .arg(&job.name)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if queued == 0 {
            tracing::trace!(job_id = %id, name = %job.name, "Duplicate job rejected");
            return Ok(EnqueueOutcome::Duplicate(id));
        }
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Claim the next runnable job named `name`. `Err` carries the wall
    /// clock millisecond the next delayed job becomes runnable, if any.
    async fn claim(&self, name: &str) -> QueueResult<Result<Job, Option<i64>>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let (claimed, value): (i64, String) = self
            .claim
            .key(self.keys.pending(name))
            .key(self.keys.active(name))
            .arg(now)
            .arg(now + self.config.claim_timeout.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if claimed == 0 {
            let next = value.parse::<f64>().ok().map(|score| score as i64);
            return Ok(Err(next));
        }

        let record: Option<String> = redis::cmd("GET")
            .arg(self.keys.job(&value))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        let decoded = record.map(|json| serde_json::from_str::<StoredJob>(&json));

        match decoded {
            Some(Ok(stored)) => Ok(Ok(stored.into_job())),
            other => {
                if let Some(Err(e)) = other {
                    tracing::error!(job_id = %value, error = %e, "Dropping undecodable job");
                }
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("ZREM")
                    .arg(self.keys.active(name))
                    .arg(&value)
                    .ignore()
                    .cmd("DEL")
                    .arg(self.keys.job(&value))
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                Ok(Err(Some(now)))
            }
        }
    }

    async fn finish(&self, mut job: Job, outcome: Result<(), String>) -> QueueResult<()> {
        job.attempts_made += 1;
        let mut conn = self.conn.clone();
        let job_key = self.keys.job(&job.id);
        let active = self.keys.active(&job.name);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREM")
            .arg(&active)
            .arg(&job.id)
            .ignore();

        match outcome {
            Ok(()) => {
                tracing::debug!(job_id = %job.id, name = %job.name, "Job completed");
                pipe.cmd("DEL").arg(&job_key).ignore();
                pipe.cmd("INCR").arg(self.keys.completed()).ignore();
                if !job.opts.remove_on_complete {
                    let record = StoredJob::from_job(&job).encode()?;
                    pipe.cmd("RPUSH")
                        .arg(self.keys.completed_jobs())
                        .arg(record)
                        .ignore();
                }
            }
            Err(reason) if job.attempts_made < job.opts.attempts => {
                let delay = job.opts.backoff.delay_for(job.attempts_made);
                tracing::warn!(
                    job_id = %job.id,
                    name = %job.name,
                    attempt = job.attempts_made,
                    max_attempts = job.opts.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Job failed, retrying"
                );
                let record = StoredJob::from_job(&job).encode()?;
                pipe.cmd("SET").arg(&job_key).arg(record).ignore();
                pipe.cmd("ZADD")
                    .arg(self.keys.pending(&job.name))
                    .arg(now_ms() + delay.as_millis() as i64)
                    .arg(&job.id)
                    .ignore();
            }
            Err(reason) => {
                tracing::error!(
                    job_id = %job.id,
                    name = %job.name,
                    attempts = job.attempts_made,
                    error = %reason,
                    "Job failed permanently"
                );
                let record = StoredJob {
                    reason: Some(reason),
                    ..StoredJob::from_job(&job)
                }
                .encode()?;
                pipe.cmd("DEL").arg(&job_key).ignore();
                pipe.cmd("RPUSH").arg(self.keys.failed()).arg(record).ignore();
            }
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.names())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let now = now_ms();
        let mut counts = QueueCounts::default();
        for name in names {
            let (waiting, pending, active): (u64, u64, u64) = redis::pipe()
                .cmd("ZCOUNT")
                .arg(self.keys.pending(&name))
                .arg("-inf")
                .arg(now)
                .cmd("ZCARD")
                .arg(self.keys.pending(&name))
                .cmd("ZCARD")
                .arg(self.keys.active(&name))
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            counts.waiting += waiting;
            counts.delayed += pending.saturating_sub(waiting);
            counts.active += active;
        }

        let (completed, failed): (Option<u64>, u64) = redis::pipe()
            .cmd("GET")
            .arg(self.keys.completed())
            .cmd("LLEN")
            .arg(self.keys.failed())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        counts.completed = completed.unwrap_or(0);
        counts.failed = failed;
        Ok(counts)
    }

    /// Enqueue the repeating job for the current period unless another
    /// process already did.
    async fn fire_repeat(&self, name: &str, payload: &Value, every: Duration) -> QueueResult<bool> {
        let every_ms = (every.as_millis() as i64).max(1);
        let slot = now_ms() / every_ms;
        let mut conn = self.conn.clone();
        let won: Option<String> = redis::cmd("SET")
            .arg(self.keys.repeat_slot(name, slot))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(every_ms * 2)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if won.is_none() {
            return Ok(false);
        }

        let opts = JobOptions::default()
            .with_job_id(format!("repeat:{name}:{slot}"))
            .remove_on_complete(true);
        let outcome = self
            .push(NewJob::new(name, payload.clone(), opts))
            .await?;
        Ok(outcome.is_queued())
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Job queue stored in Redis.
#[derive(Clone)]
pub struct RedisJobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, config: RedisQueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                conn,
                keys: QueueKeys {
                    prefix: config.prefix.clone(),
                },
                config,
                enqueue: Script::new(ENQUEUE_SCRIPT),
                claim: Script::new(CLAIM_SCRIPT),
                notify: Notify::new(),
                shutdown,
                closed: AtomicBool::new(false),
                processors: Mutex::new(HashSet::new()),
                dispatchers: Mutex::new(Vec::new()),
                repeaters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Jobs that used up their attempts, oldest first.
    pub async fn failed_jobs(&self) -> QueueResult<Vec<FailedJob>> {
        let mut conn = self.inner.conn.clone();
        let records: Vec<String> = redis::cmd("LRANGE")
            .arg(self.inner.keys.failed())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        records
            .iter()
            .map(|json| {
                let stored: StoredJob =
                    serde_json::from_str(json).map_err(|e| QueueError::Backend {
                        reason: format!("Cannot decode failed job: {}", e),
                    })?;
                let reason = stored.reason.clone().unwrap_or_default();
                Ok(FailedJob {
                    job: stored.into_job(),
                    reason,
                })
            })
            .collect()
    }

    /// Ids of waiting and delayed jobs named `name`, sorted.
    pub async fn pending_ids(&self, name: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.inner.conn.clone();
        let mut ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.inner.keys.pending(name))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        ids.sort();
        Ok(ids)
    }

    fn runtime(what: &str) -> QueueResult<tokio::runtime::Handle> {
        tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime {
            what: what.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> QueueResult<EnqueueOutcome> {
        self.inner.push(NewJob::new(name, payload, opts)).await
    }

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<EnqueueOutcome>> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push(self.inner.push(job).await?);
        }
        Ok(outcomes)
    }

    /// Every process may run the same schedule; each period is enqueued
    /// once across all of them. `limit` bounds the local ticks.
    async fn schedule_repeating(
        &self,
        name: &str,
        payload: Value,
        repeat: RepeatOptions,
    ) -> QueueResult<()> {
        if repeat.every.is_zero() {
            return Err(QueueError::InvalidOptions {
                reason: format!("repeating job {name} needs a positive period"),
            });
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let runtime = Self::runtime("repeating schedule")?;

        let inner = Arc::clone(&self.inner);
        let job_name = name.to_string();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        let handle = runtime.spawn(async move {
            let mut ticker = interval(repeat.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks: u32 = 0;

            tracing::info!(
                name = %job_name,
                every_ms = repeat.every.as_millis() as u64,
                limit = ?repeat.limit,
                "Shared repeating schedule started"
            );

            loop {
                if repeat.limit.is_some_and(|limit| ticks >= limit) {
                    tracing::info!(name = %job_name, ticks = ticks, "Repeating schedule reached its limit");
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match inner.fire_repeat(&job_name, &payload, repeat.every).await {
                            Ok(queued) => {
                                ticks += 1;
                                tracing::trace!(name = %job_name, queued = queued, "Repeat tick");
                            }
                            Err(QueueError::Closed) => break,
                            Err(e) => {
                                tracing::error!(name = %job_name, error = %e, "Failed to enqueue repeating job");
                            }
                        }
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.inner.repeaters).insert(name.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn register_processor(
        &self,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()> {
        if concurrency == 0 {
            return Err(QueueError::InvalidOptions {
                reason: format!("processor {name} needs a concurrency of at least one"),
            });
        }
        let runtime = Self::runtime("job processor")?;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        if !lock(&self.inner.processors).insert(name.to_string()) {
            return Err(QueueError::ProcessorAlreadyRegistered {
                name: name.to_string(),
            });
        }

        let dispatcher = Dispatcher {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            handler,
            permits: Arc::new(Semaphore::new(concurrency)),
            runtime: runtime.clone(),
        };
        let handle = runtime.spawn(dispatcher.run());
        lock(&self.inner.dispatchers).push(handle);

        tracing::info!(name = %name, concurrency = concurrency, "Shared job processor registered");
        Ok(())
    }

    async fn counts(&self) -> QueueCounts {
        match self.inner.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Queue counts unavailable");
                QueueCounts::default()
            }
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        for (_, handle) in lock(&self.inner.repeaters).drain() {
            handle.abort();
        }
        for handle in lock(&self.inner.dispatchers).drain(..) {
            handle.abort();
        }
        self.inner.notify.notify_waiters();

        tracing::info!(prefix = %self.inner.config.prefix, "Shared job queue closed");
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

struct Dispatcher {
    inner: Arc<Inner>,
    name: String,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    runtime: tokio::runtime::Handle,
}

impl Dispatcher {
    async fn run(self) {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let poll = self.inner.config.poll_interval;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => continue,
            };

            let job = loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let wait = match self.inner.claim(&self.name).await {
                    Ok(Ok(job)) => break Some(job),
                    Ok(Err(Some(ready_at))) => {
                        let until = (ready_at - now_ms()).max(0) as u64;
                        poll.min(Duration::from_millis(until))
                    }
                    Ok(Err(None)) => poll,
                    Err(e) => {
                        tracing::warn!(name = %self.name, error = %e, "Claim failed");
                        poll
                    }
                };

                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => break None,
                }
            };

            let Some(job) = job else {
                continue;
            };

            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&self.handler);
            let runtime = self.runtime.clone();
            self.runtime.spawn(async move {
                let _permit = permit;
                let attempt = job.clone();
                let run = runtime.spawn(async move { handler.handle(&attempt).await });
                let outcome = match run.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(join_err) => Err(format!("handler panicked: {join_err}")),
                };
                let job_id = job.id.clone();
                if let Err(e) = inner.finish(job, outcome).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                }
            });
        }

        tracing::debug!(name = %self.name, "Shared job dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(attempts_made: u32) -> Job {
        Job {
            id: "a".to_string(),
            name: "reconcile-item".to_string(),
            payload: serde_json::json!({ "itemId": "a" }),
            opts: JobOptions::default()
                .with_job_id("a")
                .with_retries(3, Backoff::Exponential(Duration::from_millis(20))),
            attempts_made,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_stored_job_keeps_retry_state() {
        let stored = StoredJob::from_job(&job(2));
        let json = stored.encode().unwrap();
        assert!(json.contains(r#""kind":"exponential""#));
        assert!(!json.contains("reason"));

        let decoded: StoredJob = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.into_job(), job(2));
    }

    #[test]
    fn test_failed_record_carries_reason() {
        let stored = StoredJob {
            reason: Some("boom".to_string()),
            ..StoredJob::from_job(&job(3))
        };
        let decoded: StoredJob = serde_json::from_str(&stored.encode().unwrap()).unwrap();
        assert_eq!(decoded.reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_keys_are_namespaced() {
        let keys = QueueKeys {
            prefix: "site-a:queue".to_string(),
        };
        assert_eq!(keys.job("x"), "site-a:queue:job:x");
        assert_eq!(keys.pending("reconcile-item"), "site-a:queue:pending:reconcile-item");
        assert_eq!(keys.active("reconcile-item"), "site-a:queue:active:reconcile-item");
        assert_eq!(
            keys.repeat_slot("reconcile-tick", 42),
            "site-a:queue:repeat:reconcile-tick:42"
        );
    }
}
