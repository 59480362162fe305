//! Key-Value Store
//!
//! Narrow capability over a shared low-latency store. Circuit-breaker state,
//! veto counters and cycle leases all live behind it, so the algorithmic core
//! never touches a concrete cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::domain::errors::KvError;

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Overwrite `key`; `ttl = None` keeps the value until deleted
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Set only if absent. Returns true when the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    /// Atomically increment and return the new value. When the increment
    /// creates the key, `ttl_on_create` becomes its expiry.
    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> KvResult<i64>;

    /// Remaining lifetime; `None` if the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Delete `key` only while it still holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local store, used by tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        if entries.get(key).map_or(false, |e| !e.is_live(now)) {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, Instant::now());
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Self::purge_expired(&mut entries, key, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> KvResult<i64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Self::purge_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: ttl_on_create.map(|t| now + t),
        });
        let current: i64 = entry.value.parse().map_err(|_| KvError::Corrupt {
            key: key.to_string(),
            value: entry.value.clone(),
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Self::purge_expired(&mut entries, key, now);
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key, Instant::now());
        let matches = entries.get(key).map_or(false, |e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}
