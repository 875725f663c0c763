//! Cache adapter: typed operations on the shared cache the executor fleet
//! writes its liveness into.
//!
//! The trait distinguishes "missing" (`Ok(None)`) from "error" (`Err`), and
//! implementations surface transient I/O failures as retriable
//! [`CacheError`]s -- a failed monitor cycle is skipped, never fatal.

pub mod keys;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Error kind for cache operations. All variants are transient from the
/// caller's perspective; loops log and retry on the next cycle.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache operation timed out")]
    Timeout,
    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Keyed string/hash/list operations with per-entry (and per-hash-field)
/// time-to-live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>>;

    /// Set one hash field, optionally with a TTL scoped to that field alone.
    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> CacheResult<()>;

    async fn get_hash_field(&self, key: &str, field: &str) -> CacheResult<Option<String>>;

    /// Enumerate all live fields of a hash. A missing hash is an empty map.
    async fn get_all_hash_fields(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Append to a list, refreshing the whole-list TTL when given.
    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Read a closed range of a list (`0, -1` for the whole list). A missing
    /// list is an empty vec.
    async fn read_list(&self, key: &str, start: isize, end: isize) -> CacheResult<Vec<String>>;

    /// Cheap liveness probe for the health endpoint.
    async fn ping(&self) -> bool;
}
