//! Time slots and clocks
//!
//! A time slot is the integer index `floor(now_ms / interval_ms)`. View
//! increments are batched per slot; a slot is closed once the clock has
//! moved past it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Wall-clock source in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// System UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Integer bucket index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSlot(i64);

impl TimeSlot {
    pub fn new(index: i64) -> Self {
        Self(index)
    }

    /// Slot containing `now_ms` for buckets of width `interval`.
    ///
    /// `interval` must be non-zero; [`crate::EngineConfig::validate`]
    /// rejects a zero bucket interval.
    pub fn at(now_ms: i64, interval: Duration) -> Self {
        let width = interval.as_millis().max(1) as i64;
        Self(now_ms.div_euclid(width))
    }

    pub fn current(clock: &dyn Clock, interval: Duration) -> Self {
        Self::at(clock.now_millis(), interval)
    }

    pub fn index(&self) -> i64 {
        self.0
    }

    /// Number of slots from `earlier` to `self`.
    pub fn slots_since(&self, earlier: TimeSlot) -> i64 {
        self.0 - earlier.0
    }

    /// Start of the slot in Unix milliseconds.
    pub fn start_millis(&self, interval: Duration) -> i64 {
        self.0 * interval.as_millis() as i64
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimeSlot {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(TimeSlot)
    }
}
