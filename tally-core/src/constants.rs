//! Constants for tally
//!
//! Defaults and fixed names shared across crates. Tunable values have a
//! matching field in [`crate::EngineConfig`].

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Length of generated item ids.
pub const ITEM_ID_LENGTH: usize = 12;

/// Alphabet for generated item ids (URL-safe).
pub const ITEM_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

// ============================================================================
// CACHE
// ============================================================================

/// Cache entry TTL (4 hours).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 4 * 60 * 60;

/// Production bucket width / reconciliation cadence.
pub const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 60;

/// Development bucket width / reconciliation cadence.
pub const DEV_BUCKET_INTERVAL_SECS: u64 = 5;

/// Repeat cap for the development tick schedule.
pub const DEV_SCHEDULER_LIMIT: u32 = 1000;

/// Closed slots older than this many intervals mark an item idle.
pub const IDLE_SLOT_GAP: i64 = 2;

// ============================================================================
// LEASES
// ============================================================================

pub const DEFAULT_LEASE_TTL_MS: u64 = 300;
pub const DEFAULT_LEASE_RETRY_COUNT: u32 = 10;
pub const DEFAULT_LEASE_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_LEASE_RETRY_JITTER_MS: u64 = 200;

// ============================================================================
// JOBS
// ============================================================================

/// Queue job name for the periodic scheduler tick.
pub const TICK_JOB: &str = "reconcile-tick";

/// Queue job name for per-item reconciliation.
pub const RECONCILE_JOB: &str = "reconcile-item";

pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_JOB_BACKOFF_MS: u64 = 1000;

/// Cap on id regeneration when create hits a primary-key collision.
pub const DEFAULT_CREATE_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// FIELD LIMITS
// ============================================================================

pub const TITLE_MIN_LEN: usize = 3;
pub const TITLE_MAX_LEN: usize = 120;
pub const CONTENT_MIN_LEN: usize = 10;
pub const CONTENT_MAX_LEN: usize = 10_000;
pub const EXCERPT_MAX_LEN: usize = 500;
pub const IMAGE_MAX_LEN: usize = 150;
