//! Cache store contract.
//!
//! A shared key-value store holding three value kinds: plain strings (used
//! for lease tokens), field hashes (item mirrors and counter buckets) and
//! string sets (the tracked-items index). Keys may carry a TTL.
//!
//! Every operation on a single key is atomic. In particular
//! [`CacheStore::hash_incr_by`] must never lose an increment under
//! concurrent callers, and [`CacheStore::set_if_absent`] /
//! [`CacheStore::delete_if_equals`] are the compare-and-set primitives the
//! lease manager is built on.

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryCacheStore;
pub use self::redis::RedisCacheStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::CacheError;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache backend trait for pluggable cache implementations.
///
/// Operations on a key holding a different value kind fail with
/// [`CacheError::WrongType`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    // === Hashes ===

    /// All fields of a hash, or `None` if the key is absent.
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>>;

    /// Set several hash fields at once. Creates the hash if needed.
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()>;

    /// Atomically add `by` to an integer field, creating it at zero.
    /// Returns the new value.
    async fn hash_incr_by(&self, key: &str, field: &str, by: i64) -> CacheResult<i64>;

    /// Remove fields from a hash. Returns how many were present.
    async fn hash_del_fields(&self, key: &str, fields: &[String]) -> CacheResult<u64>;

    // === Keys ===

    /// Set a TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Remove a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    // === Sets ===

    /// Returns `true` if the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool>;

    /// Returns `true` if the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>>;

    // === Compare-and-set ===

    /// Store `value` with `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Delete the key only if it holds exactly `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> CacheResult<bool>;

    /// Drop every key.
    async fn flush_all(&self) -> CacheResult<()>;
}
