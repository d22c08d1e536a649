//! Error types for tally operations

use std::time::Duration;
use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Unique constraint violated for item {id}")]
    UniqueViolation { id: String },

    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },

    #[error("Connection pool unavailable: {reason}")]
    PoolUnavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Shared cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Key {key} holds a {actual} value, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid field {field} in {key}: {reason}")]
    InvalidField {
        key: String,
        field: String,
        reason: String,
    },

    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },
}

/// Lease errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Timed out acquiring lease on {resources:?} after {attempts} attempts")]
    Timeout {
        resources: Vec<String>,
        attempts: u32,
    },

    #[error("Invalid lease ttl {ttl:?}")]
    InvalidTtl { ttl: Duration },

    #[error("Lease requested for no resources")]
    NoResources,

    #[error("Lease backend failure: {0}")]
    Cache(#[from] CacheError),
}

/// Job queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,

    #[error("A processor is already registered for {name}")]
    ProcessorAlreadyRegistered { name: String },

    #[error("Invalid job options: {reason}")]
    InvalidOptions { reason: String },

    #[error("No async runtime available to run {what}")]
    NoRuntime { what: String },

    #[error("Queue backend failure: {reason}")]
    Backend { reason: String },
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field {field} must be between {min} and {max} characters, got {actual}")]
    InvalidLength {
        field: String,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all tally errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Item not found: {id}")]
    ItemNotFound { id: String },

    #[error("Could not allocate a unique item id after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },

    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },
}

impl TallyError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TallyError::Lease(LeaseError::Timeout { .. })
                | TallyError::Storage(StorageError::PoolUnavailable { .. })
                | TallyError::Queue(QueueError::Backend { .. })
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TallyError::ItemNotFound { .. })
    }
}

/// Result type alias for tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
