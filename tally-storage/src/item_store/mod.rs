//! Durable item store contract.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryItemStore;
pub use postgres::{PgConfig, PgItemStore};

use async_trait::async_trait;
use tally_core::{CounterColumn, Item, ItemId, ItemUpdate, StorageError};

/// Result type for durable store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage trait for item records.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Point read by primary key.
    async fn get_by_id(&self, id: &ItemId) -> StorageResult<Option<Item>>;

    /// Atomically add `by` to a numeric column. Returns affected rows
    /// (0 when the item no longer exists).
    async fn increment_column(
        &self,
        id: &ItemId,
        column: CounterColumn,
        by: i64,
    ) -> StorageResult<u64>;

    /// Apply a partial update and return the updated record, or `None` if
    /// there is no such item.
    async fn update_by_id(&self, id: &ItemId, update: &ItemUpdate) -> StorageResult<Option<Item>>;

    /// Returns the number of deleted rows.
    async fn delete_by_id(&self, id: &ItemId) -> StorageResult<u64>;

    /// Insert a new record. Fails with [`StorageError::UniqueViolation`] if
    /// the id is taken.
    async fn create(&self, item: &Item) -> StorageResult<()>;
}
