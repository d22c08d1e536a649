//! Reconciliation worker
//!
//! Flushes an item's closed view buckets into the durable store. Each run
//! holds a lease keyed by the job id, so two workers never reconcile the
//! same item at once. All side effects are safe to repeat: deleting a
//! deleted bucket, invalidating a missing entry and retiring an untracked
//! item are no-ops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tally_core::constants::IDLE_SLOT_GAP;
use tally_core::{CounterColumn, ItemId, KeySpace, TallyError, TallyResult};
use tally_queue::{Job, JobHandler};
use tally_storage::{CacheStore, ItemStore, LeaseManager};

use crate::counter::ViewCounter;
use crate::metrics::EngineMetrics;
use crate::read_through::ReadThroughCache;

/// What one reconciliation run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The item had no buckets. It was dropped from tracking unless a
    /// view arrived during the run.
    NothingPending,
    Flushed {
        /// Views added to the durable count.
        delta: i64,
        /// Closed buckets deleted.
        flushed_slots: usize,
        /// Whether the item left the tracked set.
        retired: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcilePayload {
    item_id: ItemId,
}

pub struct ReconciliationWorker {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ItemStore>,
    leases: Arc<dyn LeaseManager>,
    counter: ViewCounter,
    reader: Arc<ReadThroughCache>,
    keys: KeySpace,
    lease_ttl: Duration,
    metrics: Arc<EngineMetrics>,
}

impl ReconciliationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ItemStore>,
        leases: Arc<dyn LeaseManager>,
        counter: ViewCounter,
        reader: Arc<ReadThroughCache>,
        keys: KeySpace,
        lease_ttl: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            cache,
            store,
            leases,
            counter,
            reader,
            keys,
            lease_ttl,
            metrics,
        }
    }

    /// Reconcile one item under its job lease.
    pub async fn reconcile(&self, id: &ItemId) -> TallyResult<ReconcileOutcome> {
        let resources = [self.keys.job_lease(id.as_str())];
        let lease = self.leases.acquire(&resources, self.lease_ttl).await?;

        let result = self.reconcile_locked(id).await;

        if let Err(e) = self.leases.release(lease).await {
            tracing::warn!(item_id = %id, error = %e, "Failed to release reconciliation lease");
        }

        match &result {
            Ok(ReconcileOutcome::NothingPending) => {
                tracing::debug!(item_id = %id, "No buckets pending, item untracked");
            }
            Ok(ReconcileOutcome::Flushed {
                delta,
                flushed_slots,
                retired,
            }) => {
                tracing::info!(
                    item_id = %id,
                    delta = *delta,
                    flushed_slots = *flushed_slots,
                    retired = *retired,
                    "Views reconciled"
                );
            }
            Err(e) => {
                tracing::warn!(item_id = %id, error = %e, "Reconciliation failed");
            }
        }
        result
    }

    async fn reconcile_locked(&self, id: &ItemId) -> TallyResult<ReconcileOutcome> {
        let current = self.counter.current_slot();

        let Some(buckets) = self.counter.load_buckets(id).await? else {
            self.reader.invalidate(id).await?;
            if self.untrack(id).await? {
                EngineMetrics::incr(&self.metrics.retirements);
            }
            return Ok(ReconcileOutcome::NothingPending);
        };

        let (closed, open) = buckets.partition(current);
        let delta = closed.total();
        let flushed_slots = closed.len();

        let rows = self
            .reader
            .write_locked(id, || async {
                let rows = if delta != 0 {
                    self.store
                        .increment_column(id, CounterColumn::ViewCount, delta)
                        .await?
                } else {
                    0
                };
                self.counter.delete_buckets(id, &closed.slots()).await?;
                Ok::<u64, TallyError>(rows)
            })
            .await?;

        EngineMetrics::incr(&self.metrics.flushes);
        if rows > 0 {
            EngineMetrics::add(&self.metrics.views_flushed, delta.max(0) as u64);
        } else if delta != 0 {
            tracing::debug!(item_id = %id, delta = delta, "Flushed views for a deleted item");
        }

        let idle = match closed.newest() {
            Some(newest) => open.is_empty() && current.slots_since(newest) > IDLE_SLOT_GAP,
            None => false,
        };
        let retired = idle && self.untrack(id).await?;
        if retired {
            self.reader.invalidate(id).await?;
            EngineMetrics::incr(&self.metrics.retirements);
        }

        Ok(ReconcileOutcome::Flushed {
            delta,
            flushed_slots,
            retired,
        })
    }

    /// Drop `id` from the tracked set. A view counted between our bucket
    /// load and the removal leaves a bucket behind; the item is tracked
    /// again in that case and `false` is returned.
    async fn untrack(&self, id: &ItemId) -> TallyResult<bool> {
        let tracked = self.keys.tracked_items();
        self.cache.set_remove(&tracked, id.as_str()).await?;

        if self.counter.load_buckets(id).await?.is_some() {
            self.cache.set_add(&tracked, id.as_str()).await?;
            tracing::debug!(item_id = %id, "View arrived during retirement, item kept");
            return Ok(false);
        }
        Ok(true)
    }

    fn item_id_for(job: &Job) -> TallyResult<ItemId> {
        let id = serde_json::from_value::<ReconcilePayload>(job.payload.clone())
            .map(|payload| payload.item_id)
            .unwrap_or_else(|_| ItemId::new(job.id.clone()));
        if id.as_str().is_empty() {
            return Err(TallyError::InvalidJob {
                reason: format!("job {} names no item", job.id),
            });
        }
        Ok(id)
    }
}

#[async_trait]
impl JobHandler for ReconciliationWorker {
    async fn handle(&self, job: &Job) -> TallyResult<()> {
        let id = Self::item_id_for(job)?;
        self.reconcile(&id).await.map(|_| ())
    }
}

impl std::fmt::Debug for ReconciliationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationWorker")
            .field("keys", &self.keys)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}
