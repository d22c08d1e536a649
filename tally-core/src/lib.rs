//! Tally Core - Shared Types
//!
//! Item records, identifiers, time slots, cache key layout, errors and
//! engine configuration. Every other tally crate depends on this one; it
//! performs no I/O.

pub mod config;
pub mod constants;
pub mod error;
pub mod item;
pub mod keys;
pub mod slot;
pub mod validation;

pub use config::{Backoff, EngineConfig, LeaseConfig, SchedulerConfig, WorkerConfig};
pub use error::{
    CacheError, ConfigError, LeaseError, QueueError, StorageError, TallyError, TallyResult,
    ValidationError,
};
pub use item::{
    CounterColumn, IdGenerator, Item, ItemId, ItemUpdate, NewItem, RandomIdGenerator,
};
pub use keys::KeySpace;
pub use slot::{Clock, ManualClock, SystemClock, TimeSlot};
