//! In-process job queue on tokio tasks.
//!
//! Each registered processor runs a dispatcher task. The dispatcher takes a
//! semaphore permit, claims the oldest runnable job of its name and runs the
//! handler on its own task so a panic counts as a failed attempt. Enqueues
//! and retries wake dispatchers through a shared [`Notify`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tally_core::QueueError;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::job::{
    EnqueueOutcome, FailedJob, Job, JobHandler, JobOptions, NewJob, QueueCounts, RepeatOptions,
};
use crate::{JobQueue, QueueResult};

const IDLE_POLL: Duration = Duration::from_millis(5);

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug)]
struct PendingJob {
    job: Job,
    ready_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<String, PendingJob>,
    active: HashSet<String>,
    completed: Vec<Job>,
    completed_count: u64,
    failed: Vec<FailedJob>,
    processors: HashSet<String>,
    closed: bool,
}

impl QueueState {
    /// Claim the oldest runnable job named `name`, or report when the next
    /// one becomes runnable.
    fn take_ready(&mut self, name: &str, now: Instant) -> Result<Job, Option<Instant>> {
        let mut best: Option<(&String, Instant, u64)> = None;
        let mut next_wake: Option<Instant> = None;

        for (id, pending) in &self.pending {
            if pending.job.name != name {
                continue;
            }
            if pending.ready_at <= now {
                let better = match best {
                    None => true,
                    Some((_, at, seq)) => (pending.ready_at, pending.seq) < (at, seq),
                };
                if better {
                    best = Some((id, pending.ready_at, pending.seq));
                }
            } else {
                next_wake = Some(match next_wake {
                    Some(at) => at.min(pending.ready_at),
                    None => pending.ready_at,
                });
            }
        }

        match best.map(|(id, _, _)| id.clone()) {
            Some(id) => match self.pending.remove(&id) {
                Some(pending) => {
                    self.active.insert(id);
                    Ok(pending.job)
                }
                None => Err(next_wake),
            },
            None => Err(next_wake),
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    seq: AtomicU64,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    repeaters: Mutex<HashMap<String, JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn push(&self, new: NewJob) -> QueueResult<EnqueueOutcome> {
        if new.opts.attempts == 0 {
            return Err(QueueError::InvalidOptions {
                reason: format!("job {} needs at least one attempt", new.name),
            });
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if state.closed {
            return Err(QueueError::Closed);
        }

        let id = new.opts.job_id.clone().unwrap_or_else(|| seq.to_string());
        if state.pending.contains_key(&id) || state.active.contains(&id) {
            tracing::trace!(job_id = %id, name = %new.name, "Duplicate job rejected");
            return Ok(EnqueueOutcome::Duplicate(id));
        }

        let ready_at = Instant::now() + new.opts.delay;
        let job = Job {
            id: id.clone(),
            name: new.name,
            payload: new.payload,
            opts: new.opts,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        };
        state.pending.insert(id.clone(), PendingJob { job, ready_at, seq });
        drop(state);

        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Queued(id))
    }

    fn finish(&self, mut job: Job, outcome: Result<(), String>) {
        job.attempts_made += 1;
        let mut state = lock(&self.state);
        state.active.remove(&job.id);

        match outcome {
            Ok(()) => {
                state.completed_count += 1;
                tracing::debug!(job_id = %job.id, name = %job.name, "Job completed");
                if !job.opts.remove_on_complete {
                    state.completed.push(job);
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
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                state.pending.insert(
                    job.id.clone(),
                    PendingJob {
                        job,
                        ready_at: Instant::now() + delay,
                        seq,
                    },
                );
            }
            Err(reason) => {
                tracing::error!(
                    job_id = %job.id,
                    name = %job.name,
                    attempts = job.attempts_made,
                    error = %reason,
                    "Job failed permanently"
                );
                state.failed.push(FailedJob { job, reason });
            }
        }
        drop(state);

        self.notify.notify_waiters();
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// Job queue held in process memory.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobQueue")
            .field("counts", &self.counts_now())
            .finish()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                shutdown,
                seq: AtomicU64::new(0),
                dispatchers: Mutex::new(Vec::new()),
                repeaters: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn counts_now(&self) -> QueueCounts {
        let now = Instant::now();
        let state = lock(&self.inner.state);
        let waiting = state
            .pending
            .values()
            .filter(|pending| pending.ready_at <= now)
            .count() as u64;
        QueueCounts {
            waiting,
            delayed: state.pending.len() as u64 - waiting,
            active: state.active.len() as u64,
            completed: state.completed_count,
            failed: state.failed.len() as u64,
        }
    }

    /// Ids of waiting and delayed jobs, sorted.
    pub fn pending_ids(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        let mut ids: Vec<String> = state.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Completed jobs that were not enqueued with `remove_on_complete`.
    pub fn completed_jobs(&self) -> Vec<Job> {
        lock(&self.inner.state).completed.clone()
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        lock(&self.inner.state).failed.clone()
    }

    /// Wait until no job is waiting, delayed or active.
    pub async fn wait_until_idle(&self) {
        while !self.counts_now().is_idle() {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    fn runtime(what: &str) -> QueueResult<tokio::runtime::Handle> {
        tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime {
            what: what.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> QueueResult<EnqueueOutcome> {
        self.inner.push(NewJob::new(name, payload, opts))
    }

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<EnqueueOutcome>> {
        jobs.into_iter().map(|job| self.inner.push(job)).collect()
    }

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
        if lock(&self.inner.state).closed {
            return Err(QueueError::Closed);
        }
        let runtime = Self::runtime("repeating schedule")?;

        let inner = Arc::clone(&self.inner);
        let job_name = name.to_string();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        let handle = runtime.spawn(async move {
            let mut ticker = interval(repeat.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut fired: u32 = 0;

            tracing::info!(
                name = %job_name,
                every_ms = repeat.every.as_millis() as u64,
                limit = ?repeat.limit,
                "Repeating schedule started"
            );

            loop {
                if repeat.limit.is_some_and(|limit| fired >= limit) {
                    tracing::info!(name = %job_name, fired = fired, "Repeating schedule reached its limit");
                    break;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let opts = JobOptions::default()
                            .with_job_id(format!("repeat:{job_name}:{fired}"))
                            .remove_on_complete(true);
                        match inner.push(NewJob::new(job_name.clone(), payload.clone(), opts)) {
                            Ok(_) => fired += 1,
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
        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !state.processors.insert(name.to_string()) {
                return Err(QueueError::ProcessorAlreadyRegistered {
                    name: name.to_string(),
                });
            }
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

        tracing::info!(name = %name, concurrency = concurrency, "Job processor registered");
        Ok(())
    }

    async fn counts(&self) -> QueueCounts {
        self.counts_now()
    }

    async fn close(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.shutdown.send_replace(true);

        for (_, handle) in lock(&self.inner.repeaters).drain() {
            handle.abort();
        }
        for handle in lock(&self.inner.dispatchers).drain(..) {
            handle.abort();
        }
        self.inner.notify.notify_waiters();

        tracing::info!(counts = ?self.counts_now(), "Job queue closed");
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

                let next = lock(&self.inner.state).take_ready(&self.name, Instant::now());
                match next {
                    Ok(job) => break Some(job),
                    Err(wake_at) => {
                        let sleep = async {
                            match wake_at {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = sleep => {}
                            _ = shutdown_rx.changed() => break None,
                        }
                    }
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
                inner.finish(job, outcome);
            });
        }

        tracing::debug!(name = %self.name, "Job dispatcher stopped");
    }
}
