//! Read-through cache for items.
//!
//! Reads are served from the cache entry at `blog:{id}` plus the item's
//! unflushed view buckets. On a miss, the entry is populated from the
//! durable store under a lease on `blog-lock:{id}`, so concurrent misses
//! across every process sharing the cache cause a single durable read.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tally_core::{Item, ItemId, KeySpace, TallyResult};
use tally_storage::{CacheStore, ItemStore, LeaseManager};

use crate::counter::ViewCounter;
use crate::metrics::EngineMetrics;

/// Lease and TTL settings for cache population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadThroughConfig {
    /// TTL of a populated entry.
    pub entry_ttl: Duration,
    /// TTL of the population lease.
    pub lease_ttl: Duration,
}

/// Item reads through the shared cache.
pub struct ReadThroughCache {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ItemStore>,
    leases: Arc<dyn LeaseManager>,
    counter: ViewCounter,
    keys: KeySpace,
    config: ReadThroughConfig,
    metrics: Arc<EngineMetrics>,
}

impl ReadThroughCache {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ItemStore>,
        leases: Arc<dyn LeaseManager>,
        counter: ViewCounter,
        keys: KeySpace,
        config: ReadThroughConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            cache,
            store,
            leases,
            counter,
            keys,
            config,
            metrics,
        }
    }

    /// Read an item and count the view.
    ///
    /// The returned `view_count` is the cached base plus every unflushed
    /// bucket, this view included. `None` if the item does not exist.
    pub async fn get(&self, id: &ItemId) -> TallyResult<Option<Item>> {
        let key = self.keys.item(id);

        let base = match self.read_entry(&key).await? {
            Some(item) => {
                EngineMetrics::incr(&self.metrics.cache_hits);
                tracing::debug!(item_id = %id, "Cache hit");
                item
            }
            None => {
                EngineMetrics::incr(&self.metrics.cache_misses);
                tracing::debug!(item_id = %id, "Cache miss");
                match self.populate(id, &key).await? {
                    Some(item) => item,
                    None => return Ok(None),
                }
            }
        };

        let delta = self.counter.increment(id).await?;
        EngineMetrics::incr(&self.metrics.views_recorded);

        // Re-track on every view; the worker may have retired the item
        // between our entry read and the increment.
        self.cache
            .set_add(&self.keys.tracked_items(), id.as_str())
            .await?;

        Ok(Some(Item {
            view_count: base.view_count + delta,
            ..base
        }))
    }

    /// Drop the cache entry. Returns whether one existed.
    pub async fn invalidate(&self, id: &ItemId) -> TallyResult<bool> {
        let removed = self.cache.delete(&self.keys.item(id)).await?;
        if removed {
            tracing::debug!(item_id = %id, "Cache entry invalidated");
        }
        Ok(removed)
    }

    /// Run a durable write for `id` while holding its population lease,
    /// then drop the cache entry.
    ///
    /// The lease spans both the write and the invalidation, so a miss that
    /// read the row before the write cannot store it after the invalidation.
    /// The entry is left alone when `write` fails.
    pub async fn write_locked<T, F, Fut>(&self, id: &ItemId, write: F) -> TallyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TallyResult<T>>,
    {
        let resources = [self.keys.item_lease(id)];
        let lease = self.leases.acquire(&resources, self.config.lease_ttl).await?;

        let result = match write().await {
            Ok(value) => self.invalidate(id).await.map(|_| value),
            Err(e) => Err(e),
        };

        if let Err(e) = self.leases.release(lease).await {
            tracing::warn!(item_id = %id, error = %e, "Failed to release write lease");
        }
        result
    }

    async fn read_entry(&self, key: &str) -> TallyResult<Option<Item>> {
        match self.cache.hash_get_all(key).await? {
            Some(fields) if !fields.is_empty() => Ok(Some(Item::from_fields(key, &fields)?)),
            _ => Ok(None),
        }
    }

    async fn populate(&self, id: &ItemId, key: &str) -> TallyResult<Option<Item>> {
        let resources = [self.keys.item_lease(id)];
        let lease = self.leases.acquire(&resources, self.config.lease_ttl).await?;

        let result = self.populate_locked(id, key).await;

        if let Err(e) = self.leases.release(lease).await {
            tracing::warn!(item_id = %id, error = %e, "Failed to release population lease");
        }
        result
    }

    async fn populate_locked(&self, id: &ItemId, key: &str) -> TallyResult<Option<Item>> {
        // Another holder may have populated the entry while we waited.
        if let Some(item) = self.read_entry(key).await? {
            tracing::debug!(item_id = %id, "Cache populated by another reader");
            return Ok(Some(item));
        }

        let Some(item) = self.store.get_by_id(id).await? else {
            tracing::debug!(item_id = %id, "Item not found in durable store");
            return Ok(None);
        };

        self.cache.hash_set_all(key, &item.to_fields()).await?;
        self.cache.expire(key, self.config.entry_ttl).await?;
        EngineMetrics::incr(&self.metrics.cache_populations);
        tracing::debug!(
            item_id = %id,
            view_count = item.view_count,
            "Cache entry populated"
        );
        Ok(Some(item))
    }
}

impl std::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
