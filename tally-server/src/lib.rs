//! Tally Server
//!
//! Loads configuration, selects backends and runs the view-count engine
//! until shutdown.

pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;

use tally_engine::{EngineBackends, TallyEngine};
use tally_queue::{InMemoryJobQueue, JobQueue, RedisJobQueue, RedisQueueConfig};
use tally_storage::{
    CacheStore, InMemoryCacheStore, InMemoryItemStore, ItemStore, PgItemStore, RedisCacheStore,
};

pub use config::{Coordination, LogFormat, ServerConfig, StoreBackend};
pub use error::{ServerError, ServerResult};
pub use telemetry::init_tracing;

/// Build the durable store selected by the configuration.
pub async fn build_store(config: &ServerConfig) -> ServerResult<Arc<dyn ItemStore>> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory item store; data does not survive restarts");
            Ok(Arc::new(InMemoryItemStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PgItemStore::connect(&config.postgres).await?;
            tracing::info!(
                target = %config.postgres.target(),
                application_name = %config.postgres.application_name,
                pool_size = config.postgres.pool_size,
                "Using the Postgres item store"
            );
            Ok(Arc::new(store))
        }
    }
}

/// Build the cache and job queue selected by the configuration. Leases
/// live in the cache, so they are shared exactly when the cache is.
pub async fn build_coordination(
    config: &ServerConfig,
) -> ServerResult<(Arc<dyn CacheStore>, Arc<dyn JobQueue>)> {
    match config.coordination {
        Coordination::Local => {
            if config.store == StoreBackend::Postgres {
                tracing::warn!(
                    "Process-local cache and queue over Postgres; run a single instance only"
                );
            }
            Ok((
                Arc::new(InMemoryCacheStore::new()),
                Arc::new(InMemoryJobQueue::new()),
            ))
        }
        Coordination::Redis => {
            let cache = RedisCacheStore::connect(&config.redis_url).await?;
            let queue = RedisJobQueue::new(
                cache.connection(),
                RedisQueueConfig {
                    prefix: config.queue_prefix(),
                    ..RedisQueueConfig::default()
                },
            );
            tracing::info!(queue_prefix = %config.queue_prefix(), "Using Redis coordination");
            Ok((Arc::new(cache), Arc::new(queue)))
        }
    }
}

/// Wire an engine onto the configured backends.
pub async fn build_engine(config: &ServerConfig) -> ServerResult<TallyEngine> {
    config.validate()?;
    let store = build_store(config).await?;
    let (cache, queue) = build_coordination(config).await?;
    let backends = EngineBackends::new(cache, store, queue);
    Ok(TallyEngine::new(config.engine.clone(), backends)?)
}

/// Start the engine and run until `shutdown` resolves.
pub async fn run<F>(engine: &TallyEngine, shutdown: F) -> ServerResult<()>
where
    F: std::future::Future<Output = ()>,
{
    engine.start().await?;
    tracing::info!("Tally server running");

    shutdown.await;
    tracing::info!("Shutdown signal received");

    let snapshot = engine.shutdown().await;
    tracing::info!(
        hit_rate = snapshot.hit_rate(),
        views_recorded = snapshot.views_recorded,
        views_flushed = snapshot.views_flushed,
        "Final engine metrics"
    );
    Ok(())
}
