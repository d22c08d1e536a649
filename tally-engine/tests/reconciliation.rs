//! Scheduler and worker behavior: flushing closed buckets, retiring idle
//! items, and running through the job queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally_core::{Backoff, ItemId, SchedulerConfig, WorkerConfig};
use tally_engine::{EngineBackends, ReconcileOutcome, TallyEngine};
use tally_storage::CacheResult;
use tally_test_utils::assertions::assert_flushed;
use tally_test_utils::fixtures::{test_config, START_MS};
use tally_test_utils::{
    CacheStore, FlakyItemStore, InMemoryCacheStore, InMemoryItemStore, InMemoryJobQueue,
    ItemStore, ManualClock, TestHarness,
};

async fn views(h: &TestHarness, id: &str, count: usize) {
    for _ in 0..count {
        h.engine.reader().get(&ItemId::new(id)).await.unwrap();
    }
}

#[tokio::test]
async fn test_flushes_closed_buckets_only() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let id = ItemId::new("a");

    views(&h, "a", 3).await;
    h.advance_slots(1);
    views(&h, "a", 5).await;
    h.advance_slots(1);
    views(&h, "a", 2).await;

    let outcome = h.engine.worker().reconcile(&id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Flushed {
            delta: 8,
            flushed_slots: 2,
            retired: false
        }
    );
    assert_eq!(h.stored_views("a").await, Some(8));
    assert!(!h.is_cached("a").await);
    assert_eq!(h.tracked().await, vec!["a"]);

    let open = h.engine.counter().load_buckets(&id).await.unwrap().unwrap();
    assert_eq!(open.slots(), vec![h.current_slot()]);
    assert_eq!(open.total(), 2);

    // Durable 8 plus the open bucket and this view.
    let item = h.engine.reader().get(&id).await.unwrap().unwrap();
    assert_eq!(item.view_count, 11);
}

#[tokio::test]
async fn test_current_slot_is_never_flushed() {
    let h = TestHarness::new();
    h.seed("a", 4).await;
    views(&h, "a", 3).await;

    let outcome = h.engine.worker().reconcile(&ItemId::new("a")).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Flushed {
            delta: 0,
            flushed_slots: 0,
            retired: false
        }
    );
    assert_eq!(h.stored_views("a").await, Some(4));
    assert_eq!(h.tracked().await, vec!["a"]);
}

#[tokio::test]
async fn test_idle_item_is_retired() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    views(&h, "a", 4).await;
    h.advance_slots(3);

    let outcome = h.engine.worker().reconcile(&ItemId::new("a")).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Flushed {
            delta: 4,
            flushed_slots: 1,
            retired: true
        }
    );
    assert!(h.tracked().await.is_empty());
    assert_eq!(h.stored_views("a").await, Some(4));
    assert_eq!(h.engine.metrics().retirements, 1);
}

#[tokio::test]
async fn test_recent_item_stays_tracked_until_buckets_drain() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let id = ItemId::new("a");
    views(&h, "a", 1).await;
    h.advance_slots(2);

    let outcome = h.engine.worker().reconcile(&id).await.unwrap();
    assert_flushed(&outcome, 1);
    assert_eq!(h.tracked().await, vec!["a"]);

    let outcome = h.engine.worker().reconcile(&id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::NothingPending);
    assert!(h.tracked().await.is_empty());
    assert_eq!(h.stored_views("a").await, Some(1));
}

/// Cache whose first load of `watched` is followed by a view from another
/// engine sharing the same backends, before the caller sees the result.
struct ViewAfterLoad {
    inner: InMemoryCacheStore,
    watched: String,
    fired: AtomicBool,
    other: Arc<TallyEngine>,
    id: ItemId,
}

#[async_trait]
impl CacheStore for ViewAfterLoad {
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>> {
        let fields = self.inner.hash_get_all(key).await?;
        if key == self.watched && !self.fired.swap(true, Ordering::SeqCst) {
            self.other
                .reader()
                .get(&self.id)
                .await
                .expect("view from the other engine");
        }
        Ok(fields)
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()> {
        self.inner.hash_set_all(key, fields).await
    }

    async fn hash_incr_by(&self, key: &str, field: &str, by: i64) -> CacheResult<i64> {
        self.inner.hash_incr_by(key, field, by).await
    }

    async fn hash_del_fields(&self, key: &str, fields: &[String]) -> CacheResult<u64> {
        self.inner.hash_del_fields(key, fields).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.inner.delete(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        self.inner.set_members(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> CacheResult<bool> {
        self.inner.delete_if_equals(key, value).await
    }

    async fn flush_all(&self) -> CacheResult<()> {
        self.inner.flush_all().await
    }
}

/// Two engines over one cache and store. The first sees a view from the
/// second right after its first load of `counter:a`.
struct RacingEngines {
    cache: InMemoryCacheStore,
    store: InMemoryItemStore,
    clock: Arc<ManualClock>,
    worker_engine: TallyEngine,
    viewer: Arc<TallyEngine>,
}

async fn racing_engines() -> RacingEngines {
    let cache = InMemoryCacheStore::new();
    let store = InMemoryItemStore::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    store
        .create(&tally_test_utils::fixtures::item("a"))
        .await
        .unwrap();

    let viewer = Arc::new(
        TallyEngine::new(
            test_config(),
            EngineBackends::new(
                Arc::new(cache.clone()),
                Arc::new(store.clone()),
                Arc::new(InMemoryJobQueue::new()),
            )
            .with_clock(clock.clone()),
        )
        .unwrap(),
    );
    let watched = ViewAfterLoad {
        inner: cache.clone(),
        watched: "counter:a".to_string(),
        fired: AtomicBool::new(false),
        other: viewer.clone(),
        id: ItemId::new("a"),
    };
    let worker_engine = TallyEngine::new(
        test_config(),
        EngineBackends::new(
            Arc::new(watched),
            Arc::new(store.clone()),
            Arc::new(InMemoryJobQueue::new()),
        )
        .with_clock(clock.clone()),
    )
    .unwrap();

    RacingEngines {
        cache,
        store,
        clock,
        worker_engine,
        viewer,
    }
}

#[tokio::test]
async fn test_view_during_empty_reconcile_keeps_item_tracked() {
    let r = racing_engines().await;
    let id = ItemId::new("a");
    r.cache.set_add("counted-blogs", "a").await.unwrap();

    let outcome = r.worker_engine.worker().reconcile(&id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::NothingPending);
    assert_eq!(r.cache.set_members("counted-blogs").await.unwrap(), vec!["a"]);
    assert_eq!(r.worker_engine.metrics().retirements, 0);

    // The view is flushed by a later run.
    r.clock.advance(test_config().bucket_interval);
    let outcome = r.worker_engine.worker().reconcile(&id).await.unwrap();
    assert_flushed(&outcome, 1);
    let stored = r.store.get_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.view_count, 1);
}

#[tokio::test]
async fn test_view_during_retirement_keeps_item_tracked() {
    let r = racing_engines().await;
    let id = ItemId::new("a");
    // Two views now, reconciled once the item has gone idle.
    r.viewer.reader().get(&id).await.unwrap();
    r.viewer.reader().get(&id).await.unwrap();
    r.clock.advance(test_config().bucket_interval * 3);

    let outcome = r.worker_engine.worker().reconcile(&id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Flushed {
            delta: 2,
            flushed_slots: 1,
            retired: false
        }
    );
    assert_eq!(r.cache.set_members("counted-blogs").await.unwrap(), vec!["a"]);

    r.clock.advance(test_config().bucket_interval);
    let outcome = r.worker_engine.worker().reconcile(&id).await.unwrap();
    assert_flushed(&outcome, 1);
    let stored = r.store.get_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.view_count, 3);
}

#[tokio::test]
async fn test_tracked_item_without_buckets_is_dropped() {
    let h = TestHarness::new();
    h.cache
        .set_add(&h.keys().tracked_items(), "orphan")
        .await
        .unwrap();

    let outcome = h
        .engine
        .worker()
        .reconcile(&ItemId::new("orphan"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NothingPending);
    assert!(h.tracked().await.is_empty());
}

#[tokio::test]
async fn test_flush_for_deleted_item_still_cleans_up() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    let id = ItemId::new("a");
    views(&h, "a", 2).await;
    h.store.delete_by_id(&id).await.unwrap();
    h.advance_slots(3);

    let outcome = h.engine.worker().reconcile(&id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Flushed {
            delta: 2,
            flushed_slots: 1,
            retired: true
        }
    );
    assert!(h.engine.counter().load_buckets(&id).await.unwrap().is_none());
    assert!(h.tracked().await.is_empty());
    // Nothing reached the durable store.
    let metrics = h.engine.metrics();
    assert_eq!(metrics.flushes, 1);
    assert_eq!(metrics.views_flushed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciles_apply_once() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    views(&h, "a", 6).await;
    h.advance_slots(1);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let worker = Arc::clone(h.engine.worker());
        handles.push(tokio::spawn(async move {
            worker.reconcile(&ItemId::new("a")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.stored_views("a").await, Some(6));
}

#[tokio::test]
async fn test_tick_then_worker_through_queue() {
    let h = TestHarness::new();
    h.seed("a", 0).await;
    h.seed("b", 0).await;
    views(&h, "a", 2).await;
    views(&h, "b", 1).await;
    h.advance_slots(1);

    let report = h.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.tracked, 2);
    assert_eq!(report.queued, 2);
    assert_eq!(h.queue.pending_ids(), vec!["a", "b"]);

    let outcomes = h.reconcile_tracked().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(h.stored_views("a").await, Some(2));
    assert_eq!(h.stored_views("b").await, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_engine_reconciles_in_background() {
    let config = test_config().with_scheduler(SchedulerConfig {
        every: Duration::from_millis(20),
        limit: Some(500),
    });
    let h = TestHarness::with_config(config);
    h.seed("a", 0).await;
    views(&h, "a", 3).await;
    h.advance_slots(1);

    h.engine.start().await.unwrap();

    let flushed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.stored_views("a").await == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(flushed.is_ok(), "background reconciliation did not flush");

    let snapshot = h.engine.shutdown().await;
    assert!(snapshot.ticks >= 1);
    assert!(snapshot.views_flushed >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_flush_is_retried() {
    let cache = InMemoryCacheStore::new();
    let store = InMemoryItemStore::new();
    let queue = InMemoryJobQueue::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let flaky = FlakyItemStore::new(store.clone(), 1);

    let config = test_config()
        .with_scheduler(SchedulerConfig {
            every: Duration::from_millis(20),
            limit: Some(1),
        })
        .with_worker(WorkerConfig {
            concurrency: 1,
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        });
    let backends = EngineBackends::new(
        Arc::new(cache.clone()),
        Arc::new(flaky.clone()),
        Arc::new(queue.clone()),
    )
    .with_clock(clock.clone());
    let engine = TallyEngine::new(config.clone(), backends).unwrap();

    store
        .create(&tally_test_utils::fixtures::item("a"))
        .await
        .unwrap();
    engine.reader().get(&ItemId::new("a")).await.unwrap();
    clock.advance(config.bucket_interval);

    engine.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let item = store.get_by_id(&ItemId::new("a")).await.unwrap().unwrap();
            if item.view_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flush retried after injected failure");

    assert_eq!(flaky.remaining_failures(), 0);
    assert!(queue.failed_jobs().is_empty());
    engine.shutdown().await;
}
