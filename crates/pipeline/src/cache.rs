#![forbid(unsafe_code)]

//! Cross-job key/value cache. Callers treat every error as a miss.

use crate::clock::Clock;
use crate::{SharedStore, lock_store};
use sm_storage::{CacheIncrementRequest, CacheSetRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend: {0}")]
    Backend(String),
    #[error("cache value for `{key}` is not an integer")]
    NotAnInteger { key: String },
}

pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Adds `delta` to an integer entry (missing counts as 0) and returns the new value.
    /// `ttl` only applies when the entry is created.
    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError>;
}

fn ttl_ms(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}

fn expiry(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl_ms(ttl).map(|ttl| now_ms.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)))
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at_ms: Option<i64>,
}

/// Process-local cache, mostly for tests and single-worker setups.
#[derive(Debug)]
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("memory cache lock poisoned".to_string()))
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at_ms.is_some_and(|exp| exp <= now_ms),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at_ms = expiry(self.clock.now_ms(), ttl);
        self.entries()?.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries()?;
        let live = entries
            .get(key)
            .filter(|entry| entry.expires_at_ms.is_none_or(|exp| exp > now_ms));
        let (current, expires_at_ms) = match live {
            Some(entry) => {
                let current = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| CacheError::NotAnInteger {
                        key: key.to_string(),
                    })?;
                (current, entry.expires_at_ms)
            }
            None => (0, expiry(now_ms, ttl)),
        };
        let next = current.saturating_add(delta);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at_ms,
            },
        );
        Ok(next)
    }
}

/// Cache backed by the store's `kv_cache` table, shared by every worker on the same database.
pub struct StoreCache {
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl StoreCache {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

fn backend(err: impl std::fmt::Display) -> CacheError {
    CacheError::Backend(err.to_string())
}

impl KvCache for StoreCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let store = lock_store(&self.store).map_err(backend)?;
        store.cache_get(key, self.clock.now_ms()).map_err(backend)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = lock_store(&self.store).map_err(backend)?;
        store
            .cache_set(CacheSetRequest {
                key: key.to_string(),
                value: value.to_string(),
                ttl_ms: ttl_ms(ttl),
                now_ms: self.clock.now_ms(),
            })
            .map_err(backend)
    }

    fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, CacheError> {
        let mut store = lock_store(&self.store).map_err(backend)?;
        store
            .cache_increment(CacheIncrementRequest {
                key: key.to_string(),
                delta,
                ttl_ms: ttl_ms(ttl),
                now_ms: self.clock.now_ms(),
            })
            .map_err(backend)
    }
}
