//! In-process cache store backed by a sharded concurrent map.
//!
//! Expiry is lazy: an expired key is dropped by the next operation that
//! touches it. Hashes and sets that become empty are removed, so `exists`
//! matches what a networked store would report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tally_core::CacheError;
use tokio::time::Instant;

use super::{CacheResult, CacheStore};

#[derive(Debug, Clone)]
enum CacheValue {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

impl CacheValue {
    fn kind(&self) -> &'static str {
        match self {
            CacheValue::Str(_) => "string",
            CacheValue::Hash(_) => "hash",
            CacheValue::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: CacheValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn hash_mut(&mut self, key: &str) -> CacheResult<&mut HashMap<String, String>> {
        match &mut self.value {
            CacheValue::Hash(map) => Ok(map),
            other => Err(wrong_type(key, "hash", other.kind())),
        }
    }

    fn set_mut(&mut self, key: &str) -> CacheResult<&mut HashSet<String>> {
        match &mut self.value {
            CacheValue::Set(set) => Ok(set),
            other => Err(wrong_type(key, "set", other.kind())),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str, actual: &'static str) -> CacheError {
    CacheError::WrongType {
        key: key.to_string(),
        expected,
        actual,
    }
}

/// Cache store shared by every clone of the handle.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.purge_expired(key);
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                CacheValue::Hash(map) => Ok(Some(map.clone())),
                other => Err(wrong_type(key, "hash", other.kind())),
            },
        }
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let map = occupied.get_mut().hash_mut(key)?;
                map.extend(fields.iter().cloned());
            }
            MapEntry::Vacant(vacant) => {
                let map = fields.iter().cloned().collect();
                vacant.insert(StoredValue::new(CacheValue::Hash(map)));
            }
        }
        Ok(())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, by: i64) -> CacheResult<i64> {
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let map = occupied.get_mut().hash_mut(key)?;
                let current = match map.get(field) {
                    None => 0,
                    Some(raw) => raw.parse::<i64>().map_err(|_| CacheError::InvalidField {
                        key: key.to_string(),
                        field: field.to_string(),
                        reason: format!("{raw:?} is not an integer"),
                    })?,
                };
                let next = current.checked_add(by).ok_or_else(|| CacheError::InvalidField {
                    key: key.to_string(),
                    field: field.to_string(),
                    reason: "increment would overflow".to_string(),
                })?;
                map.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                let mut map = HashMap::new();
                map.insert(field.to_string(), by.to_string());
                vacant.insert(StoredValue::new(CacheValue::Hash(map)));
                Ok(by)
            }
        }
    }

    async fn hash_del_fields(&self, key: &str, fields: &[String]) -> CacheResult<u64> {
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => Ok(0),
            MapEntry::Occupied(mut occupied) => {
                let map = occupied.get_mut().hash_mut(key)?;
                let removed = fields
                    .iter()
                    .filter(|field| map.remove(field.as_str()).is_some())
                    .count() as u64;
                if map.is_empty() {
                    occupied.remove();
                }
                Ok(removed)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.purge_expired(key);
        if ttl.is_zero() {
            return Ok(self.entries.remove(key).is_some());
        }
        match self.entries.get_mut(key) {
            None => Ok(false),
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        }
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.purge_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.purge_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let set = occupied.get_mut().set_mut(key)?;
                Ok(set.insert(member.to_string()))
            }
            MapEntry::Vacant(vacant) => {
                let mut set = HashSet::new();
                set.insert(member.to_string());
                vacant.insert(StoredValue::new(CacheValue::Set(set)));
                Ok(true)
            }
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => Ok(false),
            MapEntry::Occupied(mut occupied) => {
                let set = occupied.get_mut().set_mut(key)?;
                let removed = set.remove(member);
                if set.is_empty() {
                    occupied.remove();
                }
                Ok(removed)
            }
        }
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        self.purge_expired(key);
        match self.entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                CacheValue::Set(set) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                other => Err(wrong_type(key, "set", other.kind())),
            },
        }
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.purge_expired(key);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(_) => Ok(false),
            MapEntry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: CacheValue::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> CacheResult<bool> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, entry| {
            !entry.is_expired(now) && matches!(&entry.value, CacheValue::Str(v) if v == value)
        });
        Ok(removed.is_some())
    }

    async fn flush_all(&self) -> CacheResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_hash_set_and_get() {
        let cache = InMemoryCacheStore::new();
        assert_eq!(cache.hash_get_all("blog:a").await.unwrap(), None);

        cache
            .hash_set_all("blog:a", &fields(&[("title", "Hello"), ("viewCount", "3")]))
            .await
            .unwrap();
        let map = cache.hash_get_all("blog:a").await.unwrap().unwrap();
        assert_eq!(map.get("title").map(String::as_str), Some("Hello"));
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_incr_creates_and_accumulates() {
        let cache = InMemoryCacheStore::new();
        assert_eq!(cache.hash_incr_by("counter:a", "10", 1).await.unwrap(), 1);
        assert_eq!(cache.hash_incr_by("counter:a", "10", 4).await.unwrap(), 5);
        assert_eq!(cache.hash_incr_by("counter:a", "11", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer_field() {
        let cache = InMemoryCacheStore::new();
        cache
            .hash_set_all("blog:a", &fields(&[("title", "Hello")]))
            .await
            .unwrap();
        let err = cache.hash_incr_by("blog:a", "title", 1).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn test_wrong_type_reported() {
        let cache = InMemoryCacheStore::new();
        cache.set_add("counted-blogs", "a").await.unwrap();
        let err = cache.hash_get_all("counted-blogs").await.unwrap_err();
        assert_eq!(
            err,
            CacheError::WrongType {
                key: "counted-blogs".to_string(),
                expected: "hash",
                actual: "set",
            }
        );
    }

    #[tokio::test]
    async fn test_deleting_last_field_removes_key() {
        let cache = InMemoryCacheStore::new();
        cache.hash_incr_by("counter:a", "1", 3).await.unwrap();
        cache.hash_incr_by("counter:a", "2", 5).await.unwrap();

        let removed = cache
            .hash_del_fields("counter:a", &["1".to_string(), "9".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.exists("counter:a").await.unwrap());

        cache
            .hash_del_fields("counter:a", &["2".to_string()])
            .await
            .unwrap();
        assert!(!cache.exists("counter:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_membership() {
        let cache = InMemoryCacheStore::new();
        assert!(cache.set_add("s", "b").await.unwrap());
        assert!(cache.set_add("s", "a").await.unwrap());
        assert!(!cache.set_add("s", "a").await.unwrap());
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["a", "b"]);

        assert!(cache.set_remove("s", "a").await.unwrap());
        assert!(cache.set_remove("s", "b").await.unwrap());
        assert!(!cache.exists("s").await.unwrap());
        assert!(cache.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_key_after_ttl() {
        let cache = InMemoryCacheStore::new();
        cache
            .hash_set_all("blog:a", &fields(&[("title", "Hello")]))
            .await
            .unwrap();
        assert!(cache.expire("blog:a", Duration::from_secs(10)).await.unwrap());
        assert!(!cache.expire("blog:missing", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.exists("blog:a").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.exists("blog:a").await.unwrap());
        assert_eq!(cache.hash_get_all("blog:a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_ttl() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_millis(300);
        assert!(cache.set_if_absent("lease:x", "t1", ttl).await.unwrap());
        assert!(!cache.set_if_absent("lease:x", "t2", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(301)).await;
        assert!(cache.set_if_absent("lease:x", "t2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_value() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_secs(1);
        cache.set_if_absent("lease:x", "mine", ttl).await.unwrap();
        assert!(!cache.delete_if_equals("lease:x", "theirs").await.unwrap());
        assert!(cache.delete_if_equals("lease:x", "mine").await.unwrap());
        assert!(!cache.exists("lease:x").await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_all() {
        let cache = InMemoryCacheStore::new();
        cache.set_add("s", "a").await.unwrap();
        cache.hash_incr_by("h", "f", 1).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.flush_all().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let cache = InMemoryCacheStore::new();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cache.hash_incr_by("counter:a", "7", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let map = cache.hash_get_all("counter:a").await.unwrap().unwrap();
        assert_eq!(map.get("7").map(String::as_str), Some("1600"));
    }
}
