//! Redis-backed cache store.
//!
//! Uses a [`ConnectionManager`], which re-establishes the connection behind
//! the scenes, so callers only ever see transient errors. Per-hash-field TTL
//! maps onto `HPEXPIRE` (Redis >= 7.4), which the skald registration hashes
//! require.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, FromRedisValue};
use tokio::time::timeout;

use super::{CacheError, CacheResult, CacheStore};
use crate::config::CacheConfig;

pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
}

fn to_backend(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

impl RedisCache {
    /// Connect to the configured Redis endpoint.
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(to_backend)?;
        let conn = ConnectionManager::new(client).await.map_err(to_backend)?;
        Ok(Self {
            conn,
            op_timeout: config.op_timeout,
        })
    }

    /// Run one command under the per-operation deadline.
    async fn run<T: FromRedisValue>(&self, cmd: Cmd) -> CacheResult<T> {
        let mut conn = self.conn.clone();
        let query = cmd.query_async(&mut conn);
        match timeout(self.op_timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(to_backend(e)),
            Err(_) => Err(CacheError::Timeout),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run(cmd).await
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        self.run::<()>(cmd).await?;

        if let Some(ttl) = field_ttl {
            let mut expire = redis::cmd("HPEXPIRE");
            expire
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .arg("FIELDS")
                .arg(1)
                .arg(field);
            self.run::<()>(expire).await?;
        }
        Ok(())
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.run(cmd).await
    }

    async fn get_all_hash_fields(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.run::<()>(cmd).await?;

        if let Some(ttl) = ttl {
            let mut expire = redis::cmd("PEXPIRE");
            expire.arg(key).arg(ttl.as_millis() as u64);
            self.run::<()>(expire).await?;
        }
        Ok(())
    }

    async fn read_list(&self, key: &str, start: isize, end: isize) -> CacheResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(end);
        self.run(cmd).await
    }

    async fn ping(&self) -> bool {
        self.run::<String>(redis::cmd("PING")).await.is_ok()
    }
}
