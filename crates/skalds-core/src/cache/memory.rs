//! In-memory cache store for tests and single-process setups.
//!
//! TTLs are evaluated lazily against the injected [`Clock`], so tests can
//! advance a [`crate::clock::FakeClock`] instead of sleeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CacheResult, CacheStore};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|at| now_ms < at)
    }
}

#[derive(Debug, Clone)]
enum Value {
    String(Entry),
    Hash(HashMap<String, Entry>),
    List {
        items: Vec<String>,
        expires_at_ms: Option<i64>,
    },
}

pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|t| self.clock.epoch_ms() + t.as_millis() as i64)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let entry = Entry {
            value: value.to_owned(),
            expires_at_ms: self.expiry(ttl),
        };
        self.data.lock().insert(key.to_owned(), Value::String(entry));
        Ok(())
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        let now = self.clock.epoch_ms();
        let data = self.data.lock();
        match data.get(key) {
            Some(Value::String(entry)) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        field_ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let entry = Entry {
            value: value.to_owned(),
            expires_at_ms: self.expiry(field_ttl),
        };
        let mut data = self.data.lock();
        let hash = match data
            .entry(key.to_owned())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => hash,
            other => {
                // Type clash: overwrite like a fresh key.
                *other = Value::Hash(HashMap::new());
                match other {
                    Value::Hash(hash) => hash,
                    _ => unreachable!(),
                }
            }
        };
        hash.insert(field.to_owned(), entry);
        Ok(())
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let now = self.clock.epoch_ms();
        let data = self.data.lock();
        match data.get(key) {
            Some(Value::Hash(hash)) => Ok(hash
                .get(field)
                .filter(|e| e.is_live(now))
                .map(|e| e.value.clone())),
            _ => Ok(None),
        }
    }

    async fn get_all_hash_fields(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let now = self.clock.epoch_ms();
        let data = self.data.lock();
        match data.get(key) {
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .filter(|(_, e)| e.is_live(now))
                .map(|(f, e)| (f.clone(), e.value.clone()))
                .collect()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn push_list(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let expires_at_ms = self.expiry(ttl);
        let mut data = self.data.lock();
        match data.entry(key.to_owned()).or_insert_with(|| Value::List {
            items: Vec::new(),
            expires_at_ms,
        }) {
            Value::List {
                items,
                expires_at_ms: expiry,
            } => {
                items.push(value.to_owned());
                if expires_at_ms.is_some() {
                    *expiry = expires_at_ms;
                }
            }
            other => {
                *other = Value::List {
                    items: vec![value.to_owned()],
                    expires_at_ms,
                };
            }
        }
        Ok(())
    }

    async fn read_list(&self, key: &str, start: isize, end: isize) -> CacheResult<Vec<String>> {
        let now = self.clock.epoch_ms();
        let data = self.data.lock();
        let items = match data.get(key) {
            Some(Value::List {
                items,
                expires_at_ms,
            }) if expires_at_ms.is_none_or(|at| now < at) => items,
            _ => return Ok(Vec::new()),
        };

        // Redis-style closed range with negative indices from the end.
        let len = items.len() as isize;
        let resolve = |i: isize| if i < 0 { len + i } else { i };
        let from = resolve(start).max(0);
        let to = resolve(end).min(len - 1);
        if from > to || len == 0 {
            return Ok(Vec::new());
        }
        Ok(items[from as usize..=to as usize].to_vec())
    }

    async fn ping(&self) -> bool {
        true
    }
}
