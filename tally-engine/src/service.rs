//! Item service
//!
//! The operations an HTTP layer calls: get, create, update and delete an
//! item. Reads go through the read-through cache and count a view; writes
//! go to the durable store and invalidate the cache entry.

use std::sync::Arc;

use tally_core::{
    IdGenerator, Item, ItemId, ItemUpdate, KeySpace, NewItem, StorageError, TallyError,
    TallyResult,
};
use tally_storage::{CacheStore, ItemStore};

use crate::counter::ViewCounter;
use crate::metrics::EngineMetrics;
use crate::read_through::ReadThroughCache;

pub struct ItemService {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ItemStore>,
    reader: Arc<ReadThroughCache>,
    counter: ViewCounter,
    ids: Arc<dyn IdGenerator>,
    keys: KeySpace,
    create_max_attempts: u32,
    metrics: Arc<EngineMetrics>,
}

impl ItemService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ItemStore>,
        reader: Arc<ReadThroughCache>,
        counter: ViewCounter,
        ids: Arc<dyn IdGenerator>,
        keys: KeySpace,
        create_max_attempts: u32,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            cache,
            store,
            reader,
            counter,
            ids,
            keys,
            create_max_attempts,
            metrics,
        }
    }

    /// Read an item, counting one view.
    pub async fn get_item(&self, id: &ItemId) -> TallyResult<Item> {
        self.reader
            .get(id)
            .await?
            .ok_or_else(|| TallyError::ItemNotFound { id: id.to_string() })
    }

    /// Create an item under a fresh id with zero views.
    ///
    /// An id collision regenerates the id and retries, up to the configured
    /// number of attempts.
    pub async fn create_item(&self, new: NewItem) -> TallyResult<Item> {
        new.validate()?;

        for attempt in 1..=self.create_max_attempts {
            let item = Item::from_new(self.ids.generate(), new.clone());
            match self.store.create(&item).await {
                Ok(()) => {
                    tracing::info!(item_id = %item.id, "Item created");
                    return Ok(item);
                }
                Err(StorageError::UniqueViolation { id }) => {
                    EngineMetrics::incr(&self.metrics.create_collisions);
                    tracing::warn!(
                        item_id = %id,
                        attempt = attempt,
                        "Item id collision, regenerating"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TallyError::IdSpaceExhausted {
            attempts: self.create_max_attempts,
        })
    }

    /// Apply a partial update. Returns the stored record, whose view count
    /// excludes unflushed views.
    pub async fn update_item(&self, id: &ItemId, update: ItemUpdate) -> TallyResult<Item> {
        update.validate()?;

        let updated = self
            .reader
            .write_locked(id, || async {
                match self.store.update_by_id(id, &update).await {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => Err(TallyError::ItemNotFound { id: id.to_string() }),
                    Err(e) => Err(TallyError::from(e)),
                }
            })
            .await?;

        tracing::info!(item_id = %id, "Item updated");
        Ok(updated)
    }

    /// Delete an item with its cache entry and counters. Deleting a
    /// missing item is not an error; returns whether a row was removed.
    pub async fn delete_item(&self, id: &ItemId) -> TallyResult<bool> {
        let rows = self
            .reader
            .write_locked(id, || async {
                self.store.delete_by_id(id).await.map_err(TallyError::from)
            })
            .await?;
        self.counter.clear(id).await?;
        self.cache
            .set_remove(&self.keys.tracked_items(), id.as_str())
            .await?;

        if rows > 0 {
            tracing::info!(item_id = %id, "Item deleted");
        }
        Ok(rows > 0)
    }
}

impl std::fmt::Debug for ItemService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemService")
            .field("keys", &self.keys)
            .field("create_max_attempts", &self.create_max_attempts)
            .finish_non_exhaustive()
    }
}
