//! Engine wiring.
//!
//! [`TallyEngine`] builds every component from an [`EngineConfig`] and a
//! set of backends, and starts background reconciliation on the job queue.

use std::sync::Arc;

use tally_core::constants::RECONCILE_JOB;
use tally_core::{
    Clock, EngineConfig, IdGenerator, KeySpace, RandomIdGenerator, SystemClock, TallyResult,
};
use tally_queue::{JobHandler, JobQueue};
use tally_storage::{CacheLeaseManager, CacheStore, ItemStore, LeaseManager};

use crate::counter::ViewCounter;
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::read_through::{ReadThroughCache, ReadThroughConfig};
use crate::scheduler::ReconciliationScheduler;
use crate::service::ItemService;
use crate::worker::ReconciliationWorker;

/// Backends an engine runs on.
#[derive(Clone)]
pub struct EngineBackends {
    pub cache: Arc<dyn CacheStore>,
    pub store: Arc<dyn ItemStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Defaults to a [`CacheLeaseManager`] over `cache`.
    pub leases: Option<Arc<dyn LeaseManager>>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl EngineBackends {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ItemStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            cache,
            store,
            queue,
            leases: None,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIdGenerator::default()),
        }
    }

    pub fn with_leases(mut self, leases: Arc<dyn LeaseManager>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

/// A wired engine.
pub struct TallyEngine {
    config: EngineConfig,
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn JobQueue>,
    counter: ViewCounter,
    reader: Arc<ReadThroughCache>,
    scheduler: Arc<ReconciliationScheduler>,
    worker: Arc<ReconciliationWorker>,
    service: ItemService,
    metrics: Arc<EngineMetrics>,
}

impl TallyEngine {
    pub fn new(config: EngineConfig, backends: EngineBackends) -> TallyResult<Self> {
        config.validate()?;

        let keys = KeySpace::new(config.key_prefix.clone());
        let metrics = Arc::new(EngineMetrics::new());
        let EngineBackends {
            cache,
            store,
            queue,
            leases,
            clock,
            ids,
        } = backends;
        let leases = leases.unwrap_or_else(|| {
            Arc::new(CacheLeaseManager::new(cache.clone(), config.lease.clone()))
        });

        let counter = ViewCounter::new(
            cache.clone(),
            clock,
            keys.clone(),
            config.bucket_interval,
        );

        let reader = Arc::new(ReadThroughCache::new(
            cache.clone(),
            store.clone(),
            leases.clone(),
            counter.clone(),
            keys.clone(),
            ReadThroughConfig {
                entry_ttl: config.cache_ttl,
                lease_ttl: config.lease.ttl,
            },
            metrics.clone(),
        ));

        let scheduler = Arc::new(ReconciliationScheduler::new(
            cache.clone(),
            queue.clone(),
            keys.clone(),
            config.scheduler.clone(),
            config.worker.clone(),
            metrics.clone(),
        ));

        let worker = Arc::new(ReconciliationWorker::new(
            cache.clone(),
            store.clone(),
            leases,
            counter.clone(),
            reader.clone(),
            keys.clone(),
            config.lease.ttl,
            metrics.clone(),
        ));

        let service = ItemService::new(
            cache.clone(),
            store,
            reader.clone(),
            counter.clone(),
            ids,
            keys,
            config.create_max_attempts,
            metrics.clone(),
        );

        Ok(Self {
            config,
            cache,
            queue,
            counter,
            reader,
            scheduler,
            worker,
            service,
            metrics,
        })
    }

    /// Register the tick schedule and the reconciliation pool on the queue.
    ///
    /// With `flush_cache_on_startup` the whole cache backend is wiped first.
    pub async fn start(&self) -> TallyResult<()> {
        if self.config.flush_cache_on_startup {
            tracing::warn!("Flushing cache backend on startup");
            self.cache.flush_all().await?;
        }

        self.scheduler.register().await?;
        self.queue
            .register_processor(
                RECONCILE_JOB,
                self.config.worker.concurrency,
                Arc::clone(&self.worker) as Arc<dyn JobHandler>,
            )
            .await?;

        tracing::info!(
            bucket_interval_ms = self.config.bucket_interval.as_millis() as u64,
            tick_every_ms = self.config.scheduler.every.as_millis() as u64,
            tick_limit = ?self.config.scheduler.limit,
            concurrency = self.config.worker.concurrency,
            "Reconciliation started"
        );
        Ok(())
    }

    /// Close the queue and return final metrics.
    pub async fn shutdown(&self) -> EngineMetricsSnapshot {
        self.queue.close().await;
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            cache_populations = snapshot.cache_populations,
            views_recorded = snapshot.views_recorded,
            ticks = snapshot.ticks,
            jobs_queued = snapshot.jobs_queued,
            flushes = snapshot.flushes,
            views_flushed = snapshot.views_flushed,
            retirements = snapshot.retirements,
            "Engine stopped"
        );
        snapshot
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn service(&self) -> &ItemService {
        &self.service
    }

    pub fn reader(&self) -> &Arc<ReadThroughCache> {
        &self.reader
    }

    pub fn counter(&self) -> &ViewCounter {
        &self.counter
    }

    pub fn scheduler(&self) -> &Arc<ReconciliationScheduler> {
        &self.scheduler
    }

    pub fn worker(&self) -> &Arc<ReconciliationWorker> {
        &self.worker
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for TallyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TallyEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
