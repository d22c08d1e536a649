//! Engine Configuration
//!
//! Configuration for the view-count engine: bucket width, cache TTL, lease
//! timing, the reconciliation schedule and worker pool. Values are loaded
//! from `TALLY_*` environment variables with production defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

// ============================================================================
// NESTED CONFIGURATION
// ============================================================================

/// Lease acquisition timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a granted lease stays valid.
    pub ttl: Duration,
    /// Extra attempts after the first failed one.
    pub retry_count: u32,
    /// Base wait between attempts.
    pub retry_delay: Duration,
    /// Random extra wait added to each retry, up to this bound.
    pub retry_jitter: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_LEASE_TTL_MS),
            retry_count: DEFAULT_LEASE_RETRY_COUNT,
            retry_delay: Duration::from_millis(DEFAULT_LEASE_RETRY_DELAY_MS),
            retry_jitter: Duration::from_millis(DEFAULT_LEASE_RETRY_JITTER_MS),
        }
    }
}

/// Reconciliation tick schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Tick period.
    pub every: Duration,
    /// Total number of ticks before the schedule stops. `None` repeats
    /// until shutdown.
    pub limit: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            limit: None,
        }
    }
}

/// Retry delay policy for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`
    Exponential(Duration),
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let exp = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential(Duration::from_millis(DEFAULT_JOB_BACKOFF_MS))
    }
}

/// Reconciliation worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Attempts per job before it is abandoned.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Configuration for the view-count engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Width of a counter bucket. Also the minimum reconciliation cadence.
    pub bucket_interval: Duration,

    /// TTL of a populated cache entry.
    pub cache_ttl: Duration,

    pub lease: LeaseConfig,

    pub scheduler: SchedulerConfig,

    pub worker: WorkerConfig,

    /// Attempts at `create_item` before giving up on id collisions.
    pub create_max_attempts: u32,

    /// Wipe the whole cache backend when the engine starts.
    /// Development convenience only; never enabled by default.
    pub flush_cache_on_startup: bool,

    /// Optional namespace for every cache key.
    pub key_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_interval: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            lease: LeaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            create_max_attempts: DEFAULT_CREATE_MAX_ATTEMPTS,
            flush_cache_on_startup: false,
            key_prefix: String::new(),
        }
    }
}

/// Parse `key` from the environment; `None` when unset or unparsable.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// `true`, `1` or `yes` (any case) read as set.
pub fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short buckets and a bounded tick schedule for local development.
    pub fn development() -> Self {
        let interval = Duration::from_secs(DEV_BUCKET_INTERVAL_SECS);
        Self {
            bucket_interval: interval,
            scheduler: SchedulerConfig {
                every: interval,
                limit: Some(DEV_SCHEDULER_LIMIT),
            },
            ..Self::default()
        }
    }

    /// Create EngineConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TALLY_BUCKET_INTERVAL_MS`: bucket width (default: 60000)
    /// - `TALLY_CACHE_TTL_SECS`: cache entry TTL (default: 14400)
    /// - `TALLY_LEASE_TTL_MS`: lease TTL (default: 300)
    /// - `TALLY_LEASE_RETRY_COUNT`: lease retries (default: 10)
    /// - `TALLY_LEASE_RETRY_DELAY_MS`: wait between lease retries (default: 200)
    /// - `TALLY_LEASE_RETRY_JITTER_MS`: random extra wait (default: 200)
    /// - `TALLY_SCHEDULER_EVERY_MS`: tick period (default: bucket interval)
    /// - `TALLY_SCHEDULER_LIMIT`: tick count cap, 0 for unbounded (default: 0)
    /// - `TALLY_WORKER_CONCURRENCY`: worker pool size (default: 5)
    /// - `TALLY_JOB_MAX_ATTEMPTS`: attempts per job (default: 3)
    /// - `TALLY_JOB_BACKOFF_MS`: exponential backoff base (default: 1000)
    /// - `TALLY_CREATE_MAX_ATTEMPTS`: id regeneration cap (default: 5)
    /// - `TALLY_FLUSH_CACHE_ON_STARTUP`: "true" to wipe the cache on start (default: false)
    /// - `TALLY_KEY_PREFIX`: cache key namespace (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bucket_interval = env_parse::<u64>("TALLY_BUCKET_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.bucket_interval);

        let cache_ttl = env_parse::<u64>("TALLY_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);

        let lease = LeaseConfig {
            ttl: env_parse::<u64>("TALLY_LEASE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease.ttl),
            retry_count: env_parse("TALLY_LEASE_RETRY_COUNT")
                .unwrap_or(defaults.lease.retry_count),
            retry_delay: env_parse::<u64>("TALLY_LEASE_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease.retry_delay),
            retry_jitter: env_parse::<u64>("TALLY_LEASE_RETRY_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease.retry_jitter),
        };

        let scheduler = SchedulerConfig {
            every: env_parse::<u64>("TALLY_SCHEDULER_EVERY_MS")
                .map(Duration::from_millis)
                .unwrap_or(bucket_interval),
            limit: env_parse::<u32>("TALLY_SCHEDULER_LIMIT").filter(|limit| *limit > 0),
        };

        let worker = WorkerConfig {
            concurrency: env_parse("TALLY_WORKER_CONCURRENCY")
                .unwrap_or(defaults.worker.concurrency),
            max_attempts: env_parse("TALLY_JOB_MAX_ATTEMPTS")
                .unwrap_or(defaults.worker.max_attempts),
            backoff: env_parse::<u64>("TALLY_JOB_BACKOFF_MS")
                .map(|ms| Backoff::Exponential(Duration::from_millis(ms)))
                .unwrap_or(defaults.worker.backoff),
        };

        Self {
            bucket_interval,
            cache_ttl,
            lease,
            scheduler,
            worker,
            create_max_attempts: env_parse("TALLY_CREATE_MAX_ATTEMPTS")
                .unwrap_or(defaults.create_max_attempts),
            flush_cache_on_startup: env_flag("TALLY_FLUSH_CACHE_ON_STARTUP").unwrap_or(false),
            key_prefix: std::env::var("TALLY_KEY_PREFIX").unwrap_or_default(),
        }
    }

    /// Set the bucket interval and keep the tick period in step with it.
    pub fn with_bucket_interval(mut self, interval: Duration) -> Self {
        self.bucket_interval = interval;
        self.scheduler.every = interval;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_create_max_attempts(mut self, attempts: u32) -> Self {
        self.create_max_attempts = attempts;
        self
    }

    pub fn with_flush_on_startup(mut self, enabled: bool) -> Self {
        self.flush_cache_on_startup = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, value: String, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value,
                reason: reason.to_string(),
            }
        }

        if self.bucket_interval.as_millis() == 0 {
            return Err(invalid(
                "bucket_interval",
                format!("{:?}", self.bucket_interval),
                "bucket_interval must be at least one millisecond",
            ));
        }

        if self.cache_ttl.is_zero() {
            return Err(invalid(
                "cache_ttl",
                format!("{:?}", self.cache_ttl),
                "cache_ttl must be positive",
            ));
        }

        if self.lease.ttl.as_millis() == 0 {
            return Err(invalid(
                "lease.ttl",
                format!("{:?}", self.lease.ttl),
                "lease ttl must be at least one millisecond",
            ));
        }

        if self.scheduler.every.is_zero() {
            return Err(invalid(
                "scheduler.every",
                format!("{:?}", self.scheduler.every),
                "tick period must be positive",
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(invalid(
                "worker.concurrency",
                self.worker.concurrency.to_string(),
                "worker pool needs at least one slot",
            ));
        }

        if self.worker.max_attempts == 0 {
            return Err(invalid(
                "worker.max_attempts",
                self.worker.max_attempts.to_string(),
                "jobs need at least one attempt",
            ));
        }

        if self.create_max_attempts == 0 {
            return Err(invalid(
                "create_max_attempts",
                self.create_max_attempts.to_string(),
                "create needs at least one attempt",
            ));
        }

        Ok(())
    }
}
