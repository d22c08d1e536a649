//! Tally Engine - Cache-Coherent View Counting
//!
//! Serves item reads through a shared cache, counts views into time-slot
//! buckets, and reconciles closed buckets into the durable store in the
//! background.
//!
//! # Components
//!
//! - [`ReadThroughCache`]: lease-protected cache population and invalidation
//! - [`ViewCounter`]: per-slot view buckets and the unflushed aggregate
//! - [`ReconciliationScheduler`]: periodic enqueue of one job per tracked item
//! - [`ReconciliationWorker`]: flushes closed buckets and retires idle items
//! - [`ItemService`]: get / create / update / delete
//! - [`TallyEngine`]: wires the above onto a set of backends
//!
//! # Example
//!
//! ```ignore
//! let backends = EngineBackends::new(cache, store, queue);
//! let engine = TallyEngine::new(EngineConfig::from_env(), backends)?;
//! engine.start().await?;
//!
//! let item = engine.service().get_item(&id).await?;
//! ```

pub mod counter;
pub mod engine;
pub mod metrics;
pub mod read_through;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use counter::{BucketSet, ViewCounter};
pub use engine::{EngineBackends, TallyEngine};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use read_through::{ReadThroughCache, ReadThroughConfig};
pub use scheduler::{ReconciliationScheduler, TickReport};
pub use service::ItemService;
pub use worker::{ReconcileOutcome, ReconciliationWorker};
