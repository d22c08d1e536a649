//! Engine metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for engine activity since startup.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Reads served from a populated cache entry
    pub cache_hits: AtomicU64,

    /// Reads that found no cache entry
    pub cache_misses: AtomicU64,

    /// Cache entries written from the durable store
    pub cache_populations: AtomicU64,

    /// Views counted into buckets
    pub views_recorded: AtomicU64,

    /// Scheduler ticks run
    pub ticks: AtomicU64,

    /// Reconciliation jobs queued by ticks
    pub jobs_queued: AtomicU64,

    /// Reconciliation runs that flushed or cleaned up
    pub flushes: AtomicU64,

    /// Views moved from buckets into the durable store
    pub views_flushed: AtomicU64,

    /// Items dropped from tracking
    pub retirements: AtomicU64,

    /// Id collisions retried by create
    pub create_collisions: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_populations: self.cache_populations.load(Ordering::Relaxed),
            views_recorded: self.views_recorded.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            views_flushed: self.views_flushed.load(Ordering::Relaxed),
            retirements: self.retirements.load(Ordering::Relaxed),
            create_collisions: self.create_collisions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_populations: u64,
    pub views_recorded: u64,
    pub ticks: u64,
    pub jobs_queued: u64,
    pub flushes: u64,
    pub views_flushed: u64,
    pub retirements: u64,
    pub create_collisions: u64,
}

impl EngineMetricsSnapshot {
    /// Fraction of reads served from cache (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
