//! In-memory item store for testing and single-process runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tally_core::{CounterColumn, Item, ItemId, ItemUpdate, StorageError};

use super::{ItemStore, StorageResult};

/// Item store held in a shared map.
///
/// Clones share the same records. Point reads are counted so tests can
/// assert how often the cache fell through to the durable store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryItemStore {
    items: Arc<RwLock<HashMap<ItemId, Item>>>,
    reads: Arc<AtomicU64>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_by_id` calls served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> StorageResult<()> {
        self.items
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get_by_id(&self, id: &ItemId) -> StorageResult<Option<Item>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let items = self.items.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.get(id).cloned())
    }

    async fn increment_column(
        &self,
        id: &ItemId,
        column: CounterColumn,
        by: i64,
    ) -> StorageResult<u64> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        match items.get_mut(id) {
            None => Ok(0),
            Some(item) => {
                match column {
                    CounterColumn::ViewCount => {
                        item.view_count = item.view_count.checked_add(by).ok_or_else(|| {
                            StorageError::Backend {
                                reason: format!("view count overflow for item {id}"),
                            }
                        })?;
                    }
                }
                Ok(1)
            }
        }
    }

    async fn update_by_id(&self, id: &ItemId, update: &ItemUpdate) -> StorageResult<Option<Item>> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.get_mut(id).map(|item| {
            update.apply_to(item);
            item.clone()
        }))
    }

    async fn delete_by_id(&self, id: &ItemId) -> StorageResult<u64> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.remove(id).map_or(0, |_| 1))
    }

    async fn create(&self, item: &Item) -> StorageResult<()> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        if items.contains_key(&item.id) {
            return Err(StorageError::UniqueViolation {
                id: item.id.to_string(),
            });
        }
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }
}
