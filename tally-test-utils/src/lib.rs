//! Tally Test Utilities
//!
//! Shared test infrastructure for the tally workspace:
//! - A [`TestHarness`] wiring an engine onto in-memory backends and a manual clock
//! - Deterministic id generators and a fault-injecting item store
//! - Proptest generators for items and view traffic
//! - Fixtures and assertions for engine results

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

pub use tally_core::{
    Backoff, CounterColumn, EngineConfig, IdGenerator, Item, ItemId, ItemUpdate, KeySpace,
    LeaseConfig, ManualClock, NewItem, SchedulerConfig, StorageError, TallyError, TallyResult,
    TimeSlot, WorkerConfig,
};
pub use tally_engine::{EngineBackends, ReconcileOutcome, TallyEngine, TickReport};
pub use tally_queue::{InMemoryJobQueue, JobQueue};
pub use tally_storage::{
    CacheStore, InMemoryCacheStore, InMemoryItemStore, ItemStore,
};

use tally_storage::item_store::StorageResult;

// ============================================================================
// ID GENERATORS
// ============================================================================

/// Hands out a fixed sequence of ids, then `id-{n}` once the list runs out.
///
/// Repeating an id in the list simulates a primary-key collision.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    queued: Mutex<VecDeque<String>>,
    fallback: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queued: Mutex::new(ids.into_iter().map(Into::into).collect()),
            fallback: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn generate(&self) -> ItemId {
        let next = self
            .queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(id) => ItemId::new(id),
            None => {
                let n = self.fallback.fetch_add(1, Ordering::SeqCst);
                ItemId::new(format!("id-{n}"))
            }
        }
    }
}

/// Always returns the same id.
#[derive(Debug, Clone)]
pub struct FixedIdGenerator(pub String);

impl IdGenerator for FixedIdGenerator {
    fn generate(&self) -> ItemId {
        ItemId::new(self.0.clone())
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Item store whose `increment_column` fails a set number of times before
/// delegating to an in-memory store.
#[derive(Debug, Clone)]
pub struct FlakyItemStore {
    inner: InMemoryItemStore,
    increment_failures: Arc<AtomicU32>,
}

impl FlakyItemStore {
    pub fn new(inner: InMemoryItemStore, increment_failures: u32) -> Self {
        Self {
            inner,
            increment_failures: Arc::new(AtomicU32::new(increment_failures)),
        }
    }

    /// Failures still to be injected.
    pub fn remaining_failures(&self) -> u32 {
        self.increment_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemStore for FlakyItemStore {
    async fn get_by_id(&self, id: &ItemId) -> StorageResult<Option<Item>> {
        self.inner.get_by_id(id).await
    }

    async fn increment_column(
        &self,
        id: &ItemId,
        column: CounterColumn,
        by: i64,
    ) -> StorageResult<u64> {
        let injected = self
            .increment_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Backend {
                reason: "injected increment failure".to_string(),
            });
        }
        self.inner.increment_column(id, column, by).await
    }

    async fn update_by_id(&self, id: &ItemId, update: &ItemUpdate) -> StorageResult<Option<Item>> {
        self.inner.update_by_id(id, update).await
    }

    async fn delete_by_id(&self, id: &ItemId) -> StorageResult<u64> {
        self.inner.delete_by_id(id).await
    }

    async fn create(&self, item: &Item) -> StorageResult<()> {
        self.inner.create(item).await
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// An engine on in-memory backends with a manually driven clock.
///
/// The engine is not started; tests drive ticks and reconciliation
/// directly unless they call [`TallyEngine::start`] themselves.
pub struct TestHarness {
    pub cache: InMemoryCacheStore,
    pub store: InMemoryItemStore,
    pub queue: InMemoryJobQueue,
    pub clock: Arc<ManualClock>,
    pub engine: TallyEngine,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fixtures::test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Arc::new(tally_core::RandomIdGenerator::default()))
    }

    pub fn with_ids(ids: Arc<dyn IdGenerator>) -> Self {
        Self::build(fixtures::test_config(), ids)
    }

    fn build(config: EngineConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let cache = InMemoryCacheStore::new();
        let store = InMemoryItemStore::new();
        let queue = InMemoryJobQueue::new();
        let clock = Arc::new(ManualClock::new(fixtures::START_MS));

        let backends = EngineBackends::new(
            Arc::new(cache.clone()),
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
        )
        .with_clock(clock.clone())
        .with_ids(ids);

        let engine = TallyEngine::new(config, backends).expect("test config is valid");
        Self {
            cache,
            store,
            queue,
            clock,
            engine,
        }
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace::new(self.engine.config().key_prefix.clone())
    }

    /// Insert an item straight into the durable store.
    pub async fn seed(&self, id: &str, view_count: i64) -> Item {
        let item = Item {
            view_count,
            ..fixtures::item(id)
        };
        self.store
            .create(&item)
            .await
            .expect("seeded id is unique");
        item
    }

    /// Move the clock forward by whole bucket intervals.
    pub fn advance_slots(&self, slots: u32) {
        self.clock
            .advance(self.engine.config().bucket_interval * slots);
    }

    pub fn current_slot(&self) -> TimeSlot {
        self.engine.counter().current_slot()
    }

    /// Reconcile every tracked item directly, bypassing the queue.
    pub async fn reconcile_tracked(&self) -> Vec<(ItemId, ReconcileOutcome)> {
        let mut outcomes = Vec::new();
        for id in self.tracked().await {
            let id = ItemId::new(id);
            let outcome = self
                .engine
                .worker()
                .reconcile(&id)
                .await
                .expect("reconcile succeeds");
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Durable view count, or `None` if the item is gone.
    pub async fn stored_views(&self, id: &str) -> Option<i64> {
        self.store
            .get_by_id(&ItemId::new(id))
            .await
            .expect("store readable")
            .map(|item| item.view_count)
    }

    pub async fn tracked(&self) -> Vec<String> {
        self.cache
            .set_members(&self.keys().tracked_items())
            .await
            .expect("cache readable")
    }

    pub async fn is_cached(&self, id: &str) -> bool {
        self.cache
            .exists(&self.keys().item(&ItemId::new(id)))
            .await
            .expect("cache readable")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for items and view traffic.

    use super::*;
    use proptest::prelude::*;

    /// Ids drawn from the same alphabet as generated ids.
    pub fn arb_item_id() -> impl Strategy<Value = ItemId> {
        "[A-Za-z0-9_-]{12}".prop_map(ItemId::new)
    }

    /// A create request that passes validation.
    pub fn arb_new_item() -> impl Strategy<Value = NewItem> {
        (
            "[a-zA-Z ]{3,60}",
            "[a-zA-Z .,]{10,400}",
            proptest::option::of("[a-zA-Z ]{0,80}"),
            proptest::option::of("https://img\\.example\\.com/[a-z]{1,20}\\.png"),
        )
            .prop_map(|(title, content, excerpt, image)| NewItem {
                title,
                content,
                excerpt,
                image,
            })
    }

    /// Views per bucket over consecutive slots.
    pub fn arb_view_bursts() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0u8..8, 1..6)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    /// Clock start, aligned to a one-minute slot boundary.
    pub const START_MS: i64 = 1_700_000_040_000;

    /// Production defaults with short lease waits.
    pub fn test_config() -> EngineConfig {
        EngineConfig::new().with_lease(LeaseConfig {
            ttl: Duration::from_secs(2),
            retry_count: 200,
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(5),
        })
    }

    pub fn new_item() -> NewItem {
        NewItem {
            title: "Cache coherence in practice".to_string(),
            content: "Counting views without hammering the database.".to_string(),
            excerpt: Some("Counting views".to_string()),
            image: None,
        }
    }

    pub fn item(id: &str) -> Item {
        Item::from_new(ItemId::new(id), new_item())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on engine results.

    use super::*;

    #[track_caller]
    pub fn assert_item_not_found<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::ItemNotFound { .. }) => {}
            other => panic!("Expected ItemNotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &TallyResult<T>) {
        match result {
            Err(TallyError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_flushed(outcome: &ReconcileOutcome, expected_delta: i64) {
        match outcome {
            ReconcileOutcome::Flushed { delta, .. } => {
                assert_eq!(*delta, expected_delta, "Wrong flushed delta");
            }
            other => panic!("Expected Flushed({expected_delta}), got: {:?}", other),
        }
    }
}
