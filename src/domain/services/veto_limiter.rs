//! Per-symbol veto rate limiter
//!
//! Every consensus veto bumps a fixed-window counter for the symbol. Once the
//! counter reaches the limit the symbol is manage-only: open positions are
//! still managed but no new ones are opened until the window lapses or an
//! operator clears it.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::errors::KvError;
use crate::domain::policy::ConsensusPolicy;
use crate::domain::repositories::kv_store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VetoCount {
    pub count: i64,
    /// True only on the increment that reached the limit
    pub tripped: bool,
}

#[derive(Clone)]
pub struct VetoLimiter {
    store: Arc<dyn KvStore>,
    limit: u32,
    window: Duration,
}

impl VetoLimiter {
    pub fn new(store: Arc<dyn KvStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    pub fn from_policy(store: Arc<dyn KvStore>, policy: &ConsensusPolicy) -> Self {
        Self::new(store, policy.veto_limit, policy.veto_window)
    }

    fn key(symbol: &str) -> String {
        format!("consensus:veto:{}", symbol)
    }

    /// Count one veto; the window starts on the first veto
    pub async fn record_veto(&self, symbol: &str, reason: &str) -> Result<VetoCount, KvError> {
        let count = self.store.incr(&Self::key(symbol), Some(self.window)).await?;
        let tripped = count == i64::from(self.limit);
        if tripped {
            warn!(symbol, count, reason, "veto limit reached, symbol is manage-only");
        } else {
            info!(symbol, count, reason, "consensus veto recorded");
        }
        Ok(VetoCount { count, tripped })
    }

    pub async fn count(&self, symbol: &str) -> Result<i64, KvError> {
        let key = Self::key(symbol);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| KvError::Corrupt { key, value: raw }),
        }
    }

    pub async fn is_manage_only(&self, symbol: &str) -> Result<bool, KvError> {
        Ok(self.count(symbol).await? >= i64::from(self.limit))
    }

    /// Operator reset
    pub async fn clear(&self, symbol: &str) -> Result<(), KvError> {
        self.store.delete(&Self::key(symbol)).await?;
        info!(symbol, "veto counter cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::kv_store::InMemoryKvStore;
    use tokio::time::sleep;

    fn limiter(window: Duration) -> VetoLimiter {
        VetoLimiter::new(Arc::new(InMemoryKvStore::new()), 3, window)
    }

    #[tokio::test]
    async fn test_trips_exactly_at_limit() {
        let l = limiter(Duration::from_secs(60));
        assert!(!l.record_veto("BTCUSDT", "confidence_deviation").await.unwrap().tripped);
        assert!(!l.record_veto("BTCUSDT", "confidence_deviation").await.unwrap().tripped);
        assert!(!l.is_manage_only("BTCUSDT").await.unwrap());

        let third = l.record_veto("BTCUSDT", "confidence_deviation").await.unwrap();
        assert!(third.tripped);
        assert_eq!(third.count, 3);
        assert!(l.is_manage_only("BTCUSDT").await.unwrap());

        // later vetoes do not re-trip
        assert!(!l.record_veto("BTCUSDT", "x").await.unwrap().tripped);
        assert!(!l.is_manage_only("ETHUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_lapses() {
        let l = limiter(Duration::from_millis(60));
        for _ in 0..3 {
            l.record_veto("BTCUSDT", "x").await.unwrap();
        }
        assert!(l.is_manage_only("BTCUSDT").await.unwrap());
        sleep(Duration::from_millis(90)).await;
        assert!(!l.is_manage_only("BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_resets() {
        let l = limiter(Duration::from_secs(60));
        for _ in 0..3 {
            l.record_veto("BTCUSDT", "x").await.unwrap();
        }
        l.clear("BTCUSDT").await.unwrap();
        assert_eq!(l.count("BTCUSDT").await.unwrap(), 0);
        assert!(!l.is_manage_only("BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_vetoes_are_not_lost() {
        let l = limiter(Duration::from_secs(60));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let l = l.clone();
                tokio::spawn(async move { l.record_veto("BTCUSDT", "x").await.unwrap() })
            })
            .collect();
        let mut trips = 0;
        for h in handles {
            if h.await.unwrap().tripped {
                trips += 1;
            }
        }
        assert_eq!(l.count("BTCUSDT").await.unwrap(), 20);
        assert_eq!(trips, 1);
    }
}
