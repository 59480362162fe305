//! Lease Lock
//!
//! Non-blocking, auto-expiring lock over the key-value store. At most one
//! trading cycle per symbol holds the lease; a crashed holder simply lets
//! it expire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::KvError;
use crate::domain::repositories::kv_store::KvStore;

pub const CYCLE_LEASE_NAMESPACE: &str = "cycle:new";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Proof of ownership; only the holder's token can release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            ttl,
        }
    }

    /// Lock guarding the per-symbol trading cycle
    pub fn for_cycles(store: Arc<dyn KvStore>) -> Self {
        Self::new(store, CYCLE_LEASE_NAMESPACE, DEFAULT_LEASE_TTL)
    }

    pub fn key(&self, symbol: &str) -> String {
        format!("{}:{}", self.namespace, symbol)
    }

    pub async fn try_acquire(&self, symbol: &str) -> Result<Option<Lease>, KvError> {
        let key = self.key(symbol);
        let token = Uuid::new_v4().to_string();
        if self.store.set_nx(&key, &token, self.ttl).await? {
            debug!(symbol, key = %key, "lease acquired");
            Ok(Some(Lease { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Release if still ours. An expired lease already taken over by
    /// another holder is left alone.
    pub async fn release(&self, lease: &Lease) -> Result<bool, KvError> {
        let released = self.store.delete_if_equals(&lease.key, &lease.token).await?;
        if !released {
            warn!(key = %lease.key, "lease expired before release");
        }
        Ok(released)
    }

    pub async fn is_held(&self, symbol: &str) -> Result<bool, KvError> {
        Ok(self.store.get(&self.key(symbol)).await?.is_some())
    }

    /// Run `f` under the lease; `Ok(None)` when someone else holds it
    pub async fn with_lease<F, Fut, T>(&self, symbol: &str, f: F) -> Result<Option<T>, KvError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lease) = self.try_acquire(symbol).await? else {
            debug!(symbol, "lease busy, skipping");
            return Ok(None);
        };
        let value = f().await;
        if let Err(e) = self.release(&lease).await {
            // the TTL cleans up after us
            warn!(symbol, error = %e, "failed to release lease");
        }
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::kv_store::InMemoryKvStore;
    use tokio::time::sleep;

    fn lock(ttl: Duration) -> LeaseLock {
        LeaseLock::new(Arc::new(InMemoryKvStore::new()), CYCLE_LEASE_NAMESPACE, ttl)
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let l = lock(Duration::from_secs(5));
        let lease = l.try_acquire("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(lease.key, "cycle:new:BTCUSDT");
        assert!(l.try_acquire("BTCUSDT").await.unwrap().is_none());
        assert!(l.try_acquire("ETHUSDT").await.unwrap().is_some());

        assert!(l.release(&lease).await.unwrap());
        assert!(l.try_acquire("BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable_and_not_released_by_old_holder() {
        let l = lock(Duration::from_millis(40));
        let old = l.try_acquire("BTCUSDT").await.unwrap().unwrap();
        sleep(Duration::from_millis(70)).await;

        let new = l.try_acquire("BTCUSDT").await.unwrap().unwrap();
        assert!(!l.release(&old).await.unwrap());
        assert!(l.is_held("BTCUSDT").await.unwrap());
        assert!(l.release(&new).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lease_skips_when_busy() {
        let l = lock(Duration::from_secs(5));
        let _held = l.try_acquire("BTCUSDT").await.unwrap().unwrap();
        let ran = l.with_lease("BTCUSDT", || async { 1 }).await.unwrap();
        assert_eq!(ran, None);

        let ran = l.with_lease("ETHUSDT", || async { 2 }).await.unwrap();
        assert_eq!(ran, Some(2));
        assert!(!l.is_held("ETHUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_single_winner() {
        let l = lock(Duration::from_secs(5));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let l = l.clone();
                tokio::spawn(async move { l.try_acquire("BTCUSDT").await.unwrap().is_some() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
