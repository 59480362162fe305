//! Redis-backed `KvStore`
//!
//! Shares circuit-breaker state, veto counters and cycle leases between
//! processes. Increment-with-expiry and compare-and-delete run as Lua
//! scripts so each is a single atomic step on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

use crate::domain::errors::KvError;
use crate::domain::repositories::kv_store::{KvResult, KvStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INCR_WITH_EXPIRY: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 and tonumber(ARGV[1]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn backend(e: redis::RedisError) -> KvError {
    KvError::Backend(e.to_string())
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisKvStore {
    /// Connect to `redis_url`, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> KvResult<Self> {
        let client = Client::open(redis_url).map_err(backend)?;
        let conn = timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| KvError::Backend(format!("connection to {} timed out", redis_url)))?
            .map_err(backend)?;
        info!(url = redis_url, "connected to redis");
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> KvResult<i64> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl_on_create.map(millis).unwrap_or(0);
        let value: i64 = Script::new(INCR_WITH_EXPIRY)
            .key(self.key(key))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ms: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        // -2 missing, -1 no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(DELETE_IF_EQUALS)
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_one_millisecond() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
    }

    // Needs a running server: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_against_live_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisKvStore::connect(&url, format!("test:{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();

        assert_eq!(store.incr("n", Some(Duration::from_secs(10))).await.unwrap(), 1);
        assert_eq!(store.incr("n", Some(Duration::from_secs(10))).await.unwrap(), 2);
        assert!(store.ttl("n").await.unwrap().is_some());

        assert!(store.set_nx("lease", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_nx("lease", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!store.delete_if_equals("lease", "b").await.unwrap());
        assert!(store.delete_if_equals("lease", "a").await.unwrap());
        assert_eq!(store.get("lease").await.unwrap(), None);

        store.delete("n").await.unwrap();
    }
}
