//! Tally Storage - Backend Contracts and Implementations
//!
//! Three backends sit under the engine:
//!
//! - [`CacheStore`]: shared key-value store with hashes, sets and per-key TTL
//! - [`LeaseManager`]: short-lived exclusive leases over named resources
//! - [`ItemStore`]: durable item records with atomic column increments
//!
//! In-memory implementations of all three back the tests and single-process
//! deployments. [`RedisCacheStore`] shares the cache (and with it the
//! leases) between processes, and [`PgItemStore`] persists items in Postgres.

pub mod cache;
pub mod item_store;
pub mod lease;

pub use cache::{CacheResult, CacheStore, InMemoryCacheStore, RedisCacheStore};
pub use item_store::{InMemoryItemStore, ItemStore, PgConfig, PgItemStore};
pub use lease::{CacheLeaseManager, Lease, LeaseManager};
