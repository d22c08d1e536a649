//! Cache key layout.
//!
//! All engine keys come from a [`KeySpace`] so several deployments can
//! share one cache backend under different prefixes.

use crate::item::ItemId;

const ITEM_PREFIX: &str = "blog";
const COUNTER_PREFIX: &str = "counter";
const ITEM_LOCK_PREFIX: &str = "blog-lock";
const TRACKED_ITEMS: &str = "counted-blogs";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped(&self, raw: String) -> String {
        if self.prefix.is_empty() {
            raw
        } else {
            format!("{}:{}", self.prefix, raw)
        }
    }

    /// Hash mirror of the item record.
    pub fn item(&self, id: &ItemId) -> String {
        self.scoped(format!("{ITEM_PREFIX}:{id}"))
    }

    /// Hash of time-slot buckets for an item.
    pub fn counter(&self, id: &ItemId) -> String {
        self.scoped(format!("{COUNTER_PREFIX}:{id}"))
    }

    /// Set of ids with potentially unflushed buckets.
    pub fn tracked_items(&self) -> String {
        self.scoped(TRACKED_ITEMS.to_string())
    }

    /// Lease resource guarding cache population.
    pub fn item_lease(&self, id: &ItemId) -> String {
        self.scoped(format!("{ITEM_LOCK_PREFIX}:{id}"))
    }

    /// Lease resource guarding reconciliation; keyed by the job id.
    pub fn job_lease(&self, job_id: &str) -> String {
        self.scoped(job_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprefixed_keys() {
        let keys = KeySpace::default();
        let id = ItemId::new("abc");
        assert_eq!(keys.item(&id), "blog:abc");
        assert_eq!(keys.counter(&id), "counter:abc");
        assert_eq!(keys.item_lease(&id), "blog-lock:abc");
        assert_eq!(keys.tracked_items(), "counted-blogs");
        assert_eq!(keys.job_lease("abc"), "abc");
    }

    #[test]
    fn test_prefixed_keys() {
        let keys = KeySpace::new("staging");
        let id = ItemId::new("abc");
        assert_eq!(keys.item(&id), "staging:blog:abc");
        assert_eq!(keys.tracked_items(), "staging:counted-blogs");
        assert_eq!(keys.job_lease("abc"), "staging:abc");
    }
}
