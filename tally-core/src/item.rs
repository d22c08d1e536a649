//! Item records and identifiers
//!
//! An item is a single blog entry. The durable store owns the record; the
//! cache holds a flat string-field mirror of it, produced by
//! [`Item::to_fields`] and read back by [`Item::from_fields`].

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{ITEM_ID_ALPHABET, ITEM_ID_LENGTH};
use crate::error::CacheError;

// ============================================================================
// IDENTITY
// ============================================================================

/// URL-safe item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Source of fresh item identifiers.
///
/// Creation retries with a new identifier when the durable store reports a
/// primary-key collision, so implementations must not return the same id
/// forever.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> ItemId;
}

/// Random 12-character identifiers over `A-Za-z0-9_-`.
#[derive(Debug, Clone, Copy)]
pub struct RandomIdGenerator {
    length: usize,
}

impl RandomIdGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new(ITEM_ID_LENGTH)
    }
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> ItemId {
        let mut rng = rand::rng();
        let id: String = (0..self.length)
            .map(|_| {
                let idx = rng.random_range(0..ITEM_ID_ALPHABET.len());
                ITEM_ID_ALPHABET[idx] as char
            })
            .collect();
        ItemId(id)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A blog item as stored in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub content: String,
    pub excerpt: Option<String>,
    /// Stored filename, e.g. `cover.png`.
    pub image: Option<String>,
    pub view_count: i64,
}

/// Cache hash field names.
pub mod fields {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const CONTENT: &str = "content";
    pub const EXCERPT: &str = "excerpt";
    pub const IMAGE: &str = "image";
    pub const VIEW_COUNT: &str = "viewCount";
}

impl Item {
    /// Build a fresh record with a zero view count.
    pub fn from_new(id: ItemId, new: NewItem) -> Self {
        Self {
            id,
            title: new.title,
            content: new.content,
            excerpt: new.excerpt,
            image: new.image,
            view_count: 0,
        }
    }

    /// Flatten into cache hash fields. Absent optional fields are omitted.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.to_string(), self.id.to_string()),
            (fields::TITLE.to_string(), self.title.clone()),
            (fields::CONTENT.to_string(), self.content.clone()),
            (fields::VIEW_COUNT.to_string(), self.view_count.to_string()),
        ];
        if let Some(excerpt) = &self.excerpt {
            out.push((fields::EXCERPT.to_string(), excerpt.clone()));
        }
        if let Some(image) = &self.image {
            out.push((fields::IMAGE.to_string(), image.clone()));
        }
        out
    }

    /// Rebuild a record from the cache hash stored at `key`.
    pub fn from_fields(key: &str, map: &HashMap<String, String>) -> Result<Self, CacheError> {
        let required = |field: &str| {
            map.get(field).cloned().ok_or_else(|| CacheError::InvalidField {
                key: key.to_string(),
                field: field.to_string(),
                reason: "missing".to_string(),
            })
        };

        let raw_count = required(fields::VIEW_COUNT)?;
        let view_count = raw_count
            .parse::<i64>()
            .map_err(|e| CacheError::InvalidField {
                key: key.to_string(),
                field: fields::VIEW_COUNT.to_string(),
                reason: format!("{raw_count:?} is not an integer: {e}"),
            })?;

        Ok(Self {
            id: ItemId(required(fields::ID)?),
            title: required(fields::TITLE)?,
            content: required(fields::CONTENT)?,
            excerpt: map.get(fields::EXCERPT).cloned(),
            image: map.get(fields::IMAGE).cloned(),
            view_count,
        })
    }
}

/// Payload for creating an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    pub content: String,
    pub excerpt: Option<String>,
    pub image: Option<String>,
}

/// Partial update. `None` leaves a column untouched.
///
/// `view_count` is an explicit overwrite of the persisted counter; unflushed
/// buckets still accumulate on top of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub excerpt: Option<String>,
    pub image: Option<String>,
    pub view_count: Option<i64>,
}

impl ItemUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.excerpt.is_none()
            && self.image.is_none()
            && self.view_count.is_none()
    }

    /// Apply this update to an in-memory record.
    pub fn apply_to(&self, item: &mut Item) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(content) = &self.content {
            item.content = content.clone();
        }
        if let Some(excerpt) = &self.excerpt {
            item.excerpt = Some(excerpt.clone());
        }
        if let Some(image) = &self.image {
            item.image = Some(image.clone());
        }
        if let Some(view_count) = self.view_count {
            item.view_count = view_count;
        }
    }
}

/// Numeric columns that support atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterColumn {
    ViewCount,
}

impl CounterColumn {
    /// Quoted column name in the `blog` table.
    pub fn as_sql(&self) -> &'static str {
        match self {
            CounterColumn::ViewCount => "\"viewCount\"",
        }
    }
}
