//! Redis cache store.
//!
//! Every tally process pointed at the same Redis shares item entries, view
//! buckets, the tracked set and lease keys. Each trait operation maps to a
//! single Redis command, so per-key atomicity comes from the server;
//! `delete_if_equals` runs as a Lua script for the same reason.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, RedisError, Script};
use tally_core::CacheError;

use super::{CacheResult, CacheStore};

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Cache store over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
    delete_if_equals: Script,
}

impl RedisCacheStore {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Backend {
            reason: format!("Invalid Redis URL: {}", e),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend {
                reason: format!("Cannot reach Redis: {}", e),
            })?;
        tracing::info!("Connected to Redis cache");
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        }
    }

    /// A handle on the same connection, for components sharing the server.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn query<T: FromRedisValue>(
        &self,
        cmd: &Cmd,
        key: &str,
        expected: &'static str,
    ) -> CacheResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key, expected))
    }
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore").finish_non_exhaustive()
    }
}

fn map_redis_error(err: RedisError, key: &str, expected: &'static str) -> CacheError {
    if err.code() == Some("WRONGTYPE") {
        return CacheError::WrongType {
            key: key.to_string(),
            expected,
            actual: "other",
        };
    }
    tracing::error!(key = %key, error = %err, "Redis command failed");
    CacheError::Backend {
        reason: err.to_string(),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>> {
        let fields: HashMap<String, String> = self
            .query(redis::cmd("HGETALL").arg(key), key, "hash")
            .await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _added: u64 = self.query(&cmd, key, "hash").await?;
        Ok(())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, by: i64) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let result: Result<i64, RedisError> = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut conn)
            .await;
        result.map_err(|e| {
            if e.to_string().contains("not an integer") {
                CacheError::InvalidField {
                    key: key.to_string(),
                    field: field.to_string(),
                    reason: "not an integer".to_string(),
                }
            } else {
                map_redis_error(e, key, "hash")
            }
        })
    }

    async fn hash_del_fields(&self, key: &str, fields: &[String]) -> CacheResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("HDEL").arg(key).arg(fields), key, "hash")
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.query(
            redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)),
            key,
            "any",
        )
        .await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.query(redis::cmd("EXISTS").arg(key), key, "any").await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key), key, "any").await?;
        Ok(removed > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<bool> {
        let added: u64 = self
            .query(redis::cmd("SADD").arg(key).arg(member), key, "set")
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<bool> {
        let removed: u64 = self
            .query(redis::cmd("SREM").arg(key).arg(member), key, "set")
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut members: Vec<String> = self
            .query(redis::cmd("SMEMBERS").arg(key), key, "set")
            .await?;
        members.sort();
        Ok(members)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl)),
                key,
                "string",
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let removed: Result<u64, RedisError> = self
            .delete_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await;
        Ok(removed.map_err(|e| map_redis_error(e, key, "string"))? > 0)
    }

    async fn flush_all(&self) -> CacheResult<()> {
        tracing::warn!("Flushing the Redis database");
        self.query(&redis::cmd("FLUSHDB"), "*", "any").await
    }
}
