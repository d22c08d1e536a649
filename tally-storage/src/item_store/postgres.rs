//! PostgreSQL item store
//!
//! Items live in the `blog` table. The camel-cased `"viewCount"` column is
//! quoted everywhere. It is a nullable `INTEGER` read back as `bigint`, with
//! NULL treated as zero.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use tally_core::config::{env_flag, env_parse};
use tally_core::{ConfigError, CounterColumn, Item, ItemId, ItemUpdate, StorageError};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use super::{ItemStore, StorageResult};

const SELECT_COLUMNS: &str =
    r#"id, title, content, excerpt, image, COALESCE("viewCount", 0)::bigint AS view_count"#;

/// The `blog` table. Column widths follow the item field limits.
const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blog (
    id          VARCHAR(20) PRIMARY KEY,
    title       VARCHAR(120) NOT NULL,
    content     VARCHAR(10000) NOT NULL,
    excerpt     VARCHAR(500),
    image       VARCHAR(150),
    "viewCount" INTEGER DEFAULT 0
)"#;

// ============================================================================
// CONNECTION SETTINGS
// ============================================================================

const DEFAULT_APPLICATION_NAME: &str = "tally";
const DEFAULT_POOL_SIZE: usize = 16;
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the item store reaches the `blog` table.
///
/// `url` takes precedence over the discrete host settings when set, so a
/// single `postgres://` string from the deployment is enough.
#[derive(Clone)]
pub struct PgConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Reported in `pg_stat_activity`.
    pub application_name: String,
    pub pool_size: usize,
    /// Longest wait for a pooled connection before a read or flush fails
    /// with `PoolUnavailable`.
    pub checkout_timeout: Duration,
    pub connect_timeout: Duration,
    /// Create the `blog` table when the store is opened.
    pub ensure_schema: bool,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tally".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ensure_schema: false,
        }
    }
}

impl PgConfig {
    /// Overlay environment settings on the defaults.
    ///
    /// # Environment Variables
    /// - `TALLY_DATABASE_URL`: full connection string, wins over the rest
    /// - `TALLY_DB_HOST`, `TALLY_DB_PORT`, `TALLY_DB_NAME`, `TALLY_DB_USER`,
    ///   `TALLY_DB_PASSWORD`
    /// - `TALLY_DB_APPLICATION_NAME` (default: tally)
    /// - `TALLY_DB_POOL_SIZE` (default: 16)
    /// - `TALLY_DB_CHECKOUT_TIMEOUT_MS`, `TALLY_DB_CONNECT_TIMEOUT_MS`
    /// - `TALLY_DB_ENSURE_SCHEMA`: "true" to create the table on open
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("TALLY_DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            host: std::env::var("TALLY_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("TALLY_DB_PORT").unwrap_or(defaults.port),
            dbname: std::env::var("TALLY_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("TALLY_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("TALLY_DB_PASSWORD").unwrap_or(defaults.password),
            application_name: std::env::var("TALLY_DB_APPLICATION_NAME")
                .unwrap_or(defaults.application_name),
            pool_size: env_parse("TALLY_DB_POOL_SIZE").unwrap_or(defaults.pool_size),
            checkout_timeout: env_parse::<u64>("TALLY_DB_CHECKOUT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.checkout_timeout),
            connect_timeout: env_parse::<u64>("TALLY_DB_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            ensure_schema: env_flag("TALLY_DB_ENSURE_SCHEMA").unwrap_or(defaults.ensure_schema),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "TALLY_DB_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "the pool needs at least one connection".to_string(),
            });
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(ConfigError::InvalidValue {
                    field: "TALLY_DATABASE_URL".to_string(),
                    value: redact(url),
                    reason: "expected a postgres:// connection string".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Where the pool points, without credentials.
    pub fn target(&self) -> String {
        match &self.url {
            Some(url) => redact(url),
            None => format!("{}:{}/{}", self.host, self.port, self.dbname),
        }
    }

    /// Build the (lazy) connection pool.
    pub fn create_pool(&self) -> StorageResult<Pool> {
        let mut cfg = Config::new();
        match &self.url {
            Some(url) => cfg.url = Some(url.clone()),
            None => {
                cfg.host = Some(self.host.clone());
                cfg.port = Some(self.port);
                cfg.dbname = Some(self.dbname.clone());
                cfg.user = Some(self.user.clone());
                cfg.password = Some(self.password.clone());
            }
        }
        cfg.application_name = Some(self.application_name.clone());
        cfg.connect_timeout = Some(self.connect_timeout);
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.pool_size);
        pool_cfg.timeouts.wait = Some(self.checkout_timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::PoolUnavailable {
                reason: format!("Cannot build pool for {}: {}", self.target(), e),
            })
    }
}

impl std::fmt::Debug for PgConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConfig")
            .field("target", &self.target())
            .field("user", &self.user)
            .field("application_name", &self.application_name)
            .field("pool_size", &self.pool_size)
            .field("checkout_timeout", &self.checkout_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("ensure_schema", &self.ensure_schema)
            .finish_non_exhaustive()
    }
}

/// Strip the userinfo part of a connection string.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn map_pg_error(err: tokio_postgres::Error, id: &ItemId) -> StorageError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return StorageError::UniqueViolation { id: id.to_string() };
    }
    tracing::error!("Database error: {:?}", err);
    StorageError::Backend {
        reason: "Database operation failed".to_string(),
    }
}

fn map_pool_error(err: PoolError) -> StorageError {
    tracing::error!("Connection pool error: {:?}", err);
    match err {
        PoolError::Timeout(_) => StorageError::PoolUnavailable {
            reason: "Connection pool exhausted".to_string(),
        },
        PoolError::Closed => StorageError::PoolUnavailable {
            reason: "Database connection pool is closed".to_string(),
        },
        _ => StorageError::Backend {
            reason: "Failed to acquire database connection".to_string(),
        },
    }
}

fn item_from_row(row: &Row, id: &ItemId) -> StorageResult<Item> {
    let read = || -> Result<Item, tokio_postgres::Error> {
        Ok(Item {
            id: ItemId::new(row.try_get::<_, String>("id")?),
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            excerpt: row.try_get("excerpt")?,
            image: row.try_get("image")?,
            view_count: row.try_get("view_count")?,
        })
    };
    read().map_err(|e| map_pg_error(e, id))
}

// ============================================================================
// STORE
// ============================================================================

/// Item store over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgItemStore {
    pool: Pool,
}

impl PgItemStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build the pool and, when `ensure_schema` is set, create the table.
    pub async fn connect(config: &PgConfig) -> StorageResult<Self> {
        let store = Self::from_config(config)?;
        if config.ensure_schema {
            store.ensure_schema().await?;
        }
        Ok(store)
    }

    pub fn from_config(config: &PgConfig) -> StorageResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> StorageResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(map_pool_error)
    }

    /// Create the `blog` table if it does not exist.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(CREATE_TABLE_SQL).await.map_err(|e| {
            tracing::error!("Schema setup failed: {:?}", e);
            StorageError::Backend {
                reason: "Failed to create blog table".to_string(),
            }
        })
    }
}

impl std::fmt::Debug for PgItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgItemStore")
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn get_by_id(&self, id: &ItemId) -> StorageResult<Option<Item>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM blog WHERE id = $1");
        let row = conn
            .query_opt(sql.as_str(), &[&id.as_str()])
            .await
            .map_err(|e| map_pg_error(e, id))?;
        row.map(|row| item_from_row(&row, id)).transpose()
    }

    async fn increment_column(
        &self,
        id: &ItemId,
        column: CounterColumn,
        by: i64,
    ) -> StorageResult<u64> {
        let conn = self.get_conn().await?;
        let col = column.as_sql();
        let sql = format!(
            r#"UPDATE blog SET {col} = COALESCE({col}, 0) + $2::bigint WHERE id = $1"#
        );
        conn.execute(sql.as_str(), &[&id.as_str(), &by])
            .await
            .map_err(|e| map_pg_error(e, id))
    }

    async fn update_by_id(&self, id: &ItemId, update: &ItemUpdate) -> StorageResult<Option<Item>> {
        if update.is_empty() {
            return self.get_by_id(id).await;
        }

        let id_str = id.as_str();
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![&id_str];
        let mut sets: Vec<String> = Vec::new();

        if let Some(title) = &update.title {
            params.push(title);
            sets.push(format!("title = ${}", params.len()));
        }
        if let Some(content) = &update.content {
            params.push(content);
            sets.push(format!("content = ${}", params.len()));
        }
        if let Some(excerpt) = &update.excerpt {
            params.push(excerpt);
            sets.push(format!("excerpt = ${}", params.len()));
        }
        if let Some(image) = &update.image {
            params.push(image);
            sets.push(format!("image = ${}", params.len()));
        }
        if let Some(view_count) = &update.view_count {
            params.push(view_count);
            sets.push(format!(r#""viewCount" = ${}::bigint"#, params.len()));
        }

        let sql = format!(
            "UPDATE blog SET {} WHERE id = $1 RETURNING {SELECT_COLUMNS}",
            sets.join(", ")
        );

        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(sql.as_str(), &params)
            .await
            .map_err(|e| map_pg_error(e, id))?;
        row.map(|row| item_from_row(&row, id)).transpose()
    }

    async fn delete_by_id(&self, id: &ItemId) -> StorageResult<u64> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM blog WHERE id = $1", &[&id.as_str()])
            .await
            .map_err(|e| map_pg_error(e, id))
    }

    async fn create(&self, item: &Item) -> StorageResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            r#"INSERT INTO blog (id, title, content, excerpt, image, "viewCount")
               VALUES ($1, $2, $3, $4, $5, $6::bigint)"#,
            &[
                &item.id.as_str(),
                &item.title,
                &item.content,
                &item.excerpt,
                &item.image,
                &item.view_count,
            ],
        )
        .await
        .map_err(|e| map_pg_error(e, &item.id))?;
        Ok(())
    }
}
