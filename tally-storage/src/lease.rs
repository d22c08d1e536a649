//! Leases
//!
//! A lease grants one holder exclusive use of a set of named resources for
//! a bounded time. Acquisition is all-or-nothing: either every resource is
//! claimed under one token or none is.
//!
//! [`CacheLeaseManager`] stores each claim as `lease:{resource} = token`
//! with a TTL via [`CacheStore::set_if_absent`], so a crashed holder's
//! claim disappears on its own. Release deletes only keys that still hold
//! the holder's token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tally_core::{LeaseConfig, LeaseError};
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CacheStore;

const LEASE_KEY_PREFIX: &str = "lease";

/// A granted lease.
#[derive(Debug, Clone)]
pub struct Lease {
    resources: Vec<String>,
    token: Uuid,
    ttl: Duration,
    acquired_at: Instant,
}

impl Lease {
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time left before the claims lapse.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Exclusive, time-bounded locks over named resources.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Claim every resource, retrying per the manager's policy.
    ///
    /// Fails with [`LeaseError::Timeout`] once retries are exhausted.
    async fn acquire(&self, resources: &[String], ttl: Duration) -> Result<Lease, LeaseError>;

    /// Give the resources back. Releasing a lease that already lapsed is
    /// not an error.
    async fn release(&self, lease: Lease) -> Result<(), LeaseError>;
}

/// Lease manager that keeps claims in a [`CacheStore`].
#[derive(Clone)]
pub struct CacheLeaseManager {
    cache: Arc<dyn CacheStore>,
    config: LeaseConfig,
}

impl CacheLeaseManager {
    pub fn new(cache: Arc<dyn CacheStore>, config: LeaseConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn lease_key(resource: &str) -> String {
        format!("{LEASE_KEY_PREFIX}:{resource}")
    }

    /// One pass over all resources. Rolls back partial claims.
    async fn try_claim(
        &self,
        resources: &[String],
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut claimed: Vec<String> = Vec::with_capacity(resources.len());
        for resource in resources {
            let key = Self::lease_key(resource);
            match self.cache.set_if_absent(&key, token, ttl).await {
                Ok(true) => claimed.push(key),
                Ok(false) => {
                    self.roll_back(&claimed, token).await;
                    return Ok(false);
                }
                Err(e) => {
                    self.roll_back(&claimed, token).await;
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    async fn roll_back(&self, keys: &[String], token: &str) {
        for key in keys {
            if let Err(e) = self.cache.delete_if_equals(key, token).await {
                tracing::warn!(key = %key, error = %e, "Failed to roll back lease claim");
            }
        }
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }
}

impl std::fmt::Debug for CacheLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLeaseManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseManager for CacheLeaseManager {
    async fn acquire(&self, resources: &[String], ttl: Duration) -> Result<Lease, LeaseError> {
        if resources.is_empty() {
            return Err(LeaseError::NoResources);
        }
        if ttl.as_millis() == 0 {
            return Err(LeaseError::InvalidTtl { ttl });
        }

        let token = Uuid::now_v7();
        let token_str = token.to_string();
        let attempts = self.config.retry_count.saturating_add(1);

        for attempt in 1..=attempts {
            let started = Instant::now();
            if self.try_claim(resources, &token_str, ttl).await? {
                // Claims taken too slowly may already be lapsing.
                if started.elapsed() < ttl {
                    return Ok(Lease {
                        resources: resources.to_vec(),
                        token,
                        ttl,
                        acquired_at: started,
                    });
                }
                let keys: Vec<String> = resources.iter().map(|r| Self::lease_key(r)).collect();
                self.roll_back(&keys, &token_str).await;
            }

            if attempt < attempts {
                tracing::debug!(
                    resources = ?resources,
                    attempt = attempt,
                    "Lease contended, retrying"
                );
                tokio::time::sleep(self.retry_pause()).await;
            }
        }

        Err(LeaseError::Timeout {
            resources: resources.to_vec(),
            attempts,
        })
    }

    async fn release(&self, lease: Lease) -> Result<(), LeaseError> {
        let token = lease.token.to_string();
        for resource in &lease.resources {
            let key = Self::lease_key(resource);
            if !self.cache.delete_if_equals(&key, &token).await? {
                tracing::warn!(
                    resource = %resource,
                    token = %lease.token,
                    "Lease lapsed before release"
                );
            }
        }
        Ok(())
    }
}
