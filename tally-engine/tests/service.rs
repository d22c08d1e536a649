//! Item service operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tally_core::{CounterColumn, Item, ItemId, ItemUpdate, ManualClock, NewItem, TallyError};
use tally_engine::{EngineBackends, TallyEngine};
use tally_storage::item_store::StorageResult;
use tally_test_utils::assertions::{assert_item_not_found, assert_validation_error};
use tally_test_utils::fixtures::{item, new_item, test_config, START_MS};
use tally_test_utils::generators::arb_new_item;
use tally_test_utils::{
    CacheStore, FixedIdGenerator, InMemoryCacheStore, InMemoryItemStore, InMemoryJobQueue,
    ItemStore, SequenceIdGenerator, TestHarness,
};

/// Item store whose first read parks after loading the row, until the test
/// lets it continue.
#[derive(Clone)]
struct ParkedReadStore {
    inner: InMemoryItemStore,
    parked: Arc<AtomicBool>,
    reading: Arc<tokio::sync::Notify>,
    resume: Arc<tokio::sync::Notify>,
}

impl ParkedReadStore {
    fn new(inner: InMemoryItemStore) -> Self {
        Self {
            inner,
            parked: Arc::new(AtomicBool::new(false)),
            reading: Arc::new(tokio::sync::Notify::new()),
            resume: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

#[async_trait]
impl ItemStore for ParkedReadStore {
    async fn get_by_id(&self, id: &ItemId) -> StorageResult<Option<Item>> {
        let row = self.inner.get_by_id(id).await?;
        if !self.parked.swap(true, Ordering::SeqCst) {
            self.reading.notify_one();
            self.resume.notified().await;
        }
        Ok(row)
    }

    async fn increment_column(
        &self,
        id: &ItemId,
        column: CounterColumn,
        by: i64,
    ) -> StorageResult<u64> {
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

fn engine_on(store: ParkedReadStore, cache: InMemoryCacheStore) -> Arc<TallyEngine> {
    let backends = EngineBackends::new(
        Arc::new(cache),
        Arc::new(store),
        Arc::new(InMemoryJobQueue::new()),
    )
    .with_clock(Arc::new(ManualClock::new(START_MS)));
    Arc::new(TallyEngine::new(test_config(), backends).unwrap())
}

#[tokio::test]
async fn test_create_starts_at_zero_views() {
    let h = TestHarness::new();

    let item = h.engine.service().create_item(new_item()).await.unwrap();
    assert_eq!(item.view_count, 0);
    assert_eq!(item.id.as_str().len(), 12);
    assert_eq!(h.stored_views(item.id.as_str()).await, Some(0));
    assert!(!h.is_cached(item.id.as_str()).await);
}

#[tokio::test]
async fn test_create_retries_id_collision() {
    let h = TestHarness::with_ids(Arc::new(SequenceIdGenerator::new(["taken", "taken", "fresh"])));
    h.seed("taken", 0).await;

    let item = h.engine.service().create_item(new_item()).await.unwrap();
    assert_eq!(item.id, ItemId::new("fresh"));
    assert_eq!(h.engine.metrics().create_collisions, 2);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn test_create_gives_up_after_max_attempts() {
    let h = TestHarness::with_ids(Arc::new(FixedIdGenerator("taken".to_string())));
    h.seed("taken", 0).await;

    let result = h.engine.service().create_item(new_item()).await;
    match result {
        Err(TallyError::IdSpaceExhausted { attempts }) => {
            assert_eq!(attempts, h.engine.config().create_max_attempts);
        }
        other => panic!("Expected IdSpaceExhausted, got: {:?}", other),
    }
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_create_rejects_invalid_input() {
    let h = TestHarness::new();
    let result = h
        .engine
        .service()
        .create_item(NewItem {
            title: "no".to_string(),
            ..new_item()
        })
        .await;
    assert_validation_error(&result);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_get_counts_a_view() {
    let h = TestHarness::new();
    let created = h.engine.service().create_item(new_item()).await.unwrap();

    let first = h.engine.service().get_item(&created.id).await.unwrap();
    let second = h.engine.service().get_item(&created.id).await.unwrap();
    assert_eq!(first.view_count, 1);
    assert_eq!(second.view_count, 2);
    assert_eq!(second.title, created.title);
}

#[tokio::test]
async fn test_update_invalidates_cache() {
    let h = TestHarness::new();
    h.seed("a", 7).await;
    let id = ItemId::new("a");
    h.engine.service().get_item(&id).await.unwrap();
    assert!(h.is_cached("a").await);

    let updated = h
        .engine
        .service()
        .update_item(
            &id,
            ItemUpdate {
                title: Some("A better title".to_string()),
                ..ItemUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.title, "A better title");
    // Unflushed views are not part of the stored record.
    assert_eq!(updated.view_count, 7);
    assert!(!h.is_cached("a").await);

    let read = h.engine.service().get_item(&id).await.unwrap();
    assert_eq!(read.title, "A better title");
    assert_eq!(read.view_count, 9);
}

#[tokio::test]
async fn test_update_during_cache_fill_is_not_lost() {
    let inner = InMemoryItemStore::new();
    inner.create(&item("a")).await.unwrap();
    let store = ParkedReadStore::new(inner);
    let cache = InMemoryCacheStore::new();
    let engine = engine_on(store.clone(), cache.clone());
    let id = ItemId::new("a");

    // A miss loads the old row, then stalls before writing the entry.
    let reader = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.service().get_item(&id).await })
    };
    store.reading.notified().await;

    let writer = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move {
            engine
                .service()
                .update_item(
                    &id,
                    ItemUpdate {
                        title: Some("Fresh title".to_string()),
                        ..ItemUpdate::default()
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.resume.notify_one();

    let stale = reader.await.unwrap().unwrap();
    assert_eq!(stale.title, "Cache coherence in practice");
    assert_eq!(writer.await.unwrap().unwrap().title, "Fresh title");

    let read = engine.service().get_item(&id).await.unwrap();
    assert_eq!(read.title, "Fresh title");
    assert!(!cache.exists("lease:blog-lock:a").await.unwrap());
}

#[tokio::test]
async fn test_update_view_count_overwrites_base() {
    let h = TestHarness::new();
    h.seed("a", 7).await;
    let id = ItemId::new("a");
    h.engine.service().get_item(&id).await.unwrap();

    h.engine
        .service()
        .update_item(
            &id,
            ItemUpdate {
                view_count: Some(100),
                ..ItemUpdate::default()
            },
        )
        .await
        .unwrap();

    let read = h.engine.service().get_item(&id).await.unwrap();
    assert_eq!(read.view_count, 102);
}

#[tokio::test]
async fn test_update_missing_item() {
    let h = TestHarness::new();
    let result = h
        .engine
        .service()
        .update_item(
            &ItemId::new("ghost"),
            ItemUpdate {
                title: Some("Still a title".to_string()),
                ..ItemUpdate::default()
            },
        )
        .await;
    assert_item_not_found(&result);
}

#[tokio::test]
async fn test_update_rejects_view_count_beyond_column_range() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let result = h
        .engine
        .service()
        .update_item(
            &ItemId::new("a"),
            ItemUpdate {
                view_count: Some(i64::from(i32::MAX) + 1),
                ..ItemUpdate::default()
            },
        )
        .await;
    assert_validation_error(&result);
    assert_eq!(h.stored_views("a").await, Some(0));
}

#[tokio::test]
async fn test_update_rejects_negative_view_count() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let result = h
        .engine
        .service()
        .update_item(
            &ItemId::new("a"),
            ItemUpdate {
                view_count: Some(-1),
                ..ItemUpdate::default()
            },
        )
        .await;
    assert_validation_error(&result);
}

#[tokio::test]
async fn test_delete_clears_cache_and_counters() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let id = ItemId::new("a");
    h.engine.service().get_item(&id).await.unwrap();
    h.engine.service().get_item(&id).await.unwrap();

    assert!(h.engine.service().delete_item(&id).await.unwrap());

    assert!(!h.is_cached("a").await);
    assert!(h.engine.counter().load_buckets(&id).await.unwrap().is_none());
    assert!(h.tracked().await.is_empty());
    assert_eq!(h.stored_views("a").await, None);
    assert_item_not_found(&h.engine.service().get_item(&id).await);
}

#[tokio::test]
async fn test_delete_missing_item_is_not_an_error() {
    let h = TestHarness::new();
    assert!(!h.engine.service().delete_item(&ItemId::new("ghost")).await.unwrap());
}

#[tokio::test]
async fn test_keys_respect_prefix() {
    let h = TestHarness::with_config(tally_test_utils::fixtures::test_config().with_key_prefix("site-a"));
    h.seed("a", 0).await;
    h.engine.service().get_item(&ItemId::new("a")).await.unwrap();

    assert!(h.cache.exists("site-a:blog:a").await.unwrap());
    assert_eq!(
        h.cache.set_members("site-a:counted-blogs").await.unwrap(),
        vec!["a"]
    );
    assert!(!h.cache.exists("blog:a").await.unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_valid_items_round_trip_through_store(new in arb_new_item()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = TestHarness::new();
            let created = h.engine.service().create_item(new.clone()).await.unwrap();
            let stored = h.store.get_by_id(&created.id).await.unwrap().unwrap();
            assert_eq!(stored.title, new.title);
            assert_eq!(stored.content, new.content);
            assert_eq!(stored.excerpt, new.excerpt);
            assert_eq!(stored.image, new.image);
            assert_eq!(stored.view_count, 0);
        });
    }
}
