//! Server configuration.

use std::str::FromStr;

use tally_core::config::env_flag;
use tally_core::{ConfigError, EngineConfig};
use tally_storage::PgConfig;

/// Durable store selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Process-local store; data is lost on exit.
    #[default]
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            other => Err(ConfigError::InvalidValue {
                field: "TALLY_STORE".to_string(),
                value: other.to_string(),
                reason: "expected memory or postgres".to_string(),
            }),
        }
    }
}

/// Where cache entries, view buckets, leases and jobs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coordination {
    /// In this process only. Safe for a single instance.
    #[default]
    Local,
    /// In Redis, shared by every instance pointed at it.
    Redis,
}

impl FromStr for Coordination {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "memory" => Ok(Coordination::Local),
            "redis" => Ok(Coordination::Redis),
            other => Err(ConfigError::InvalidValue {
                field: "TALLY_COORDINATION".to_string(),
                value: other.to_string(),
                reason: "expected local or redis".to_string(),
            }),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue {
                field: "TALLY_LOG_FORMAT".to_string(),
                value: other.to_string(),
                reason: "expected pretty or json".to_string(),
            }),
        }
    }
}

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub store: StoreBackend,
    pub coordination: Coordination,
    pub redis_url: String,
    /// Permit a durable store with process-local coordination. Only one
    /// instance may then run against the store.
    pub single_instance: bool,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
    pub postgres: PgConfig,
}

impl ServerConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    /// - `TALLY_STORE`: `memory` or `postgres` (default: memory)
    /// - `TALLY_COORDINATION`: `local` or `redis` (default: local)
    /// - `TALLY_REDIS_URL`: Redis server for `redis` coordination
    /// - `TALLY_SINGLE_INSTANCE`: "true" to run Postgres with local coordination
    /// - `TALLY_LOG_FORMAT`: `pretty` or `json` (default: pretty)
    /// - `TALLY_*` engine, `TALLY_DATABASE_URL` and `TALLY_DB_*` settings
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = match std::env::var("TALLY_STORE") {
            Ok(value) => value.parse()?,
            Err(_) => StoreBackend::default(),
        };
        let coordination = match std::env::var("TALLY_COORDINATION") {
            Ok(value) => value.parse()?,
            Err(_) => Coordination::default(),
        };
        let log_format = match std::env::var("TALLY_LOG_FORMAT") {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };

        let config = Self {
            store,
            coordination,
            redis_url: std::env::var("TALLY_REDIS_URL")
                .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            single_instance: env_flag("TALLY_SINGLE_INSTANCE").unwrap_or(false),
            log_format,
            engine: EngineConfig::from_env(),
            postgres: PgConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// A durable store shared by several instances needs shared
    /// coordination; otherwise each instance flushes views the others
    /// cannot see and caches rows the others update.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.store == StoreBackend::Postgres {
            self.postgres.validate()?;
            if self.coordination == Coordination::Local && !self.single_instance {
                return Err(ConfigError::InvalidValue {
                    field: "TALLY_COORDINATION".to_string(),
                    value: "local".to_string(),
                    reason: "postgres needs redis coordination, or TALLY_SINGLE_INSTANCE=true"
                        .to_string(),
                });
            }
        }
        if self.coordination == Coordination::Redis
            && !(self.redis_url.starts_with("redis://") || self.redis_url.starts_with("rediss://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "TALLY_REDIS_URL".to_string(),
                value: self.redis_url.clone(),
                reason: "expected a redis:// or rediss:// URL".to_string(),
            });
        }
        Ok(())
    }

    /// Key namespace for the shared job queue, next to the engine keys.
    pub fn queue_prefix(&self) -> String {
        if self.engine.key_prefix.is_empty() {
            "tally-queue".to_string()
        } else {
            format!("{}:tally-queue", self.engine.key_prefix)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::default(),
            coordination: Coordination::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            single_instance: false,
            log_format: LogFormat::default(),
            engine: EngineConfig::default(),
            postgres: PgConfig::default(),
        }
    }
}
