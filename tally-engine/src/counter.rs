//! View counter
//!
//! Views are counted into per-item buckets keyed by [`TimeSlot`]. The
//! bucket hash at `counter:{id}` maps the decimal slot index to a count.
//! The unflushed aggregate of an item is the sum over all of its buckets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tally_core::{CacheError, Clock, ItemId, KeySpace, TallyResult, TimeSlot};
use tally_storage::CacheStore;

/// Bucket counts of one item, ordered by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSet {
    buckets: BTreeMap<TimeSlot, i64>,
}

impl BucketSet {
    /// Parse the stored bucket hash at `key`.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, CacheError> {
        let mut buckets = BTreeMap::new();
        for (field, raw) in fields {
            let slot = field
                .parse::<TimeSlot>()
                .map_err(|e| CacheError::InvalidField {
                    key: key.to_string(),
                    field: field.clone(),
                    reason: format!("bucket key is not a slot index: {e}"),
                })?;
            let count = raw.parse::<i64>().map_err(|e| CacheError::InvalidField {
                key: key.to_string(),
                field: field.clone(),
                reason: format!("{raw:?} is not a count: {e}"),
            })?;
            buckets.insert(slot, count);
        }
        Ok(Self { buckets })
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, slot: TimeSlot) -> Option<i64> {
        self.buckets.get(&slot).copied()
    }

    /// Sum of all bucket counts.
    pub fn total(&self) -> i64 {
        self.buckets.values().sum()
    }

    pub fn slots(&self) -> Vec<TimeSlot> {
        self.buckets.keys().copied().collect()
    }

    pub fn newest(&self) -> Option<TimeSlot> {
        self.buckets.keys().next_back().copied()
    }

    /// Split into closed slots (strictly before `current`) and open ones.
    pub fn partition(mut self, current: TimeSlot) -> (BucketSet, BucketSet) {
        let open = self.buckets.split_off(&current);
        (self, BucketSet { buckets: open })
    }
}

impl FromIterator<(TimeSlot, i64)> for BucketSet {
    fn from_iter<I: IntoIterator<Item = (TimeSlot, i64)>>(iter: I) -> Self {
        Self {
            buckets: iter.into_iter().collect(),
        }
    }
}

/// Records views into time-slot buckets.
#[derive(Clone)]
pub struct ViewCounter {
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    interval: Duration,
}

impl ViewCounter {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            clock,
            keys,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn current_slot(&self) -> TimeSlot {
        TimeSlot::current(self.clock.as_ref(), self.interval)
    }

    /// Count one view in the current slot and return the item's unflushed
    /// aggregate, including this view.
    pub async fn increment(&self, id: &ItemId) -> TallyResult<i64> {
        let key = self.keys.counter(id);
        let slot = self.current_slot();
        self.cache
            .hash_incr_by(&key, &slot.to_string(), 1)
            .await?;

        let total = self
            .load_buckets(id)
            .await?
            .map(|buckets| buckets.total())
            .unwrap_or(0);
        Ok(total)
    }

    /// All buckets of an item, `None` if it has none.
    pub async fn load_buckets(&self, id: &ItemId) -> TallyResult<Option<BucketSet>> {
        let key = self.keys.counter(id);
        match self.cache.hash_get_all(&key).await? {
            Some(fields) if !fields.is_empty() => Ok(Some(BucketSet::from_fields(&key, &fields)?)),
            _ => Ok(None),
        }
    }

    /// Remove flushed buckets. Returns how many existed.
    pub async fn delete_buckets(&self, id: &ItemId, slots: &[TimeSlot]) -> TallyResult<u64> {
        if slots.is_empty() {
            return Ok(0);
        }
        let fields: Vec<String> = slots.iter().map(TimeSlot::to_string).collect();
        Ok(self
            .cache
            .hash_del_fields(&self.keys.counter(id), &fields)
            .await?)
    }

    /// Drop every bucket of an item.
    pub async fn clear(&self, id: &ItemId) -> TallyResult<bool> {
        Ok(self.cache.delete(&self.keys.counter(id)).await?)
    }
}

impl std::fmt::Debug for ViewCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewCounter")
            .field("keys", &self.keys)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tally_core::ManualClock;
    use tally_storage::InMemoryCacheStore;

    fn counter(clock: Arc<ManualClock>) -> (ViewCounter, InMemoryCacheStore) {
        let cache = InMemoryCacheStore::new();
        let counter = ViewCounter::new(
            Arc::new(cache.clone()),
            clock,
            KeySpace::default(),
            Duration::from_secs(5),
        );
        (counter, cache)
    }

    #[tokio::test]
    async fn test_increment_sums_all_buckets() {
        let clock = Arc::new(ManualClock::new(0));
        let (counter, _) = counter(clock.clone());
        let id = ItemId::new("a");

        assert_eq!(counter.increment(&id).await.unwrap(), 1);
        assert_eq!(counter.increment(&id).await.unwrap(), 2);

        clock.advance(Duration::from_secs(5));
        assert_eq!(counter.increment(&id).await.unwrap(), 3);

        let buckets = counter.load_buckets(&id).await.unwrap().unwrap();
        assert_eq!(buckets.get(TimeSlot::new(0)), Some(2));
        assert_eq!(buckets.get(TimeSlot::new(1)), Some(1));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let (counter, cache) = counter(clock.clone());
        let id = ItemId::new("a");

        counter.increment(&id).await.unwrap();
        clock.advance(Duration::from_secs(5));
        counter.increment(&id).await.unwrap();

        assert_eq!(
            counter.delete_buckets(&id, &[TimeSlot::new(0)]).await.unwrap(),
            1
        );
        assert_eq!(counter.load_buckets(&id).await.unwrap().unwrap().total(), 1);

        assert!(counter.clear(&id).await.unwrap());
        assert!(counter.load_buckets(&id).await.unwrap().is_none());
        assert!(!cache.exists("counter:a").await.unwrap());
    }

    #[test]
    fn test_partition_keeps_current_slot_open() {
        let buckets: BucketSet = [(TimeSlot::new(1), 3), (TimeSlot::new(2), 5), (TimeSlot::new(3), 2)]
            .into_iter()
            .collect();
        let (closed, open) = buckets.partition(TimeSlot::new(3));
        assert_eq!(closed.total(), 8);
        assert_eq!(closed.slots(), vec![TimeSlot::new(1), TimeSlot::new(2)]);
        assert_eq!(closed.newest(), Some(TimeSlot::new(2)));
        assert_eq!(open.slots(), vec![TimeSlot::new(3)]);
    }

    #[test]
    fn test_bad_bucket_field_rejected() {
        let mut fields = HashMap::new();
        fields.insert("not-a-slot".to_string(), "1".to_string());
        assert!(BucketSet::from_fields("counter:a", &fields).is_err());
    }

    proptest! {
        #[test]
        fn prop_partition_preserves_total(
            counts in proptest::collection::btree_map(0i64..50, 0i64..1_000, 0..20),
            current in 0i64..60,
        ) {
            let buckets: BucketSet = counts.iter().map(|(s, c)| (TimeSlot::new(*s), *c)).collect();
            let total = buckets.total();
            let (closed, open) = buckets.partition(TimeSlot::new(current));
            prop_assert_eq!(closed.total() + open.total(), total);
            prop_assert!(closed.slots().iter().all(|s| s.index() < current));
            prop_assert!(open.slots().iter().all(|s| s.index() >= current));
        }
    }
}
