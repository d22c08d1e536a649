//! Reconciliation scheduler
//!
//! On every tick, enqueue one reconciliation job per tracked item. The job
//! id is the item id, so the queue's id dedup keeps at most one pending
//! reconciliation per item no matter how many processes tick.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tally_core::constants::{RECONCILE_JOB, TICK_JOB};
use tally_core::{KeySpace, SchedulerConfig, TallyResult, WorkerConfig};
use tally_queue::{Job, JobHandler, JobOptions, JobQueue, NewJob, RepeatOptions};
use tally_storage::CacheStore;

use crate::metrics::EngineMetrics;

/// Result of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Items in the tracked set.
    pub tracked: usize,
    /// Jobs newly queued.
    pub queued: usize,
    /// Items that already had a job waiting or running.
    pub deduplicated: usize,
}

pub struct ReconciliationScheduler {
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn JobQueue>,
    keys: KeySpace,
    schedule: SchedulerConfig,
    worker: WorkerConfig,
    metrics: Arc<EngineMetrics>,
}

impl ReconciliationScheduler {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn JobQueue>,
        keys: KeySpace,
        schedule: SchedulerConfig,
        worker: WorkerConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            cache,
            queue,
            keys,
            schedule,
            worker,
            metrics,
        }
    }

    /// Payload of a reconciliation job.
    pub fn job_payload(item_id: &str) -> Value {
        json!({ "itemId": item_id })
    }

    /// Snapshot the tracked set and enqueue a job for each member.
    pub async fn tick(&self) -> TallyResult<TickReport> {
        EngineMetrics::incr(&self.metrics.ticks);
        let tracked = self.cache.set_members(&self.keys.tracked_items()).await?;

        let jobs: Vec<NewJob> = tracked
            .iter()
            .map(|id| {
                let opts = JobOptions::default()
                    .with_job_id(id.clone())
                    .remove_on_complete(true)
                    .with_retries(self.worker.max_attempts, self.worker.backoff);
                NewJob::new(RECONCILE_JOB, Self::job_payload(id), opts)
            })
            .collect();

        let outcomes = self.queue.enqueue_bulk(jobs).await?;
        let queued = outcomes.iter().filter(|o| o.is_queued()).count();
        let report = TickReport {
            tracked: tracked.len(),
            queued,
            deduplicated: outcomes.len() - queued,
        };
        EngineMetrics::add(&self.metrics.jobs_queued, queued as u64);

        if report.tracked > 0 {
            tracing::info!(
                tracked = report.tracked,
                queued = report.queued,
                deduplicated = report.deduplicated,
                "Reconciliation tick"
            );
        } else {
            tracing::trace!("Reconciliation tick with no tracked items");
        }
        Ok(report)
    }

    /// Install the repeating tick and its processor.
    pub async fn register(self: &Arc<Self>) -> TallyResult<()> {
        self.queue
            .register_processor(TICK_JOB, 1, Arc::clone(self) as Arc<dyn JobHandler>)
            .await?;
        self.queue
            .schedule_repeating(
                TICK_JOB,
                Value::Null,
                RepeatOptions {
                    every: self.schedule.every,
                    limit: self.schedule.limit,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ReconciliationScheduler {
    async fn handle(&self, _job: &Job) -> TallyResult<()> {
        self.tick().await.map(|_| ())
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("keys", &self.keys)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}
