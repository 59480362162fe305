//! Trade Store
//!
//! Persistence contract for the local book. Both operations are conditional
//! so concurrent cycles and reconciliation passes cannot double-book:
//! `insert_open` refuses a second OPEN trade for the same
//! (symbol, provenance) and refuses an orphan adoption while any OPEN trade
//! holds the same symbol and side. `update_open` refuses to touch a trade
//! that is no longer OPEN.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::entities::trade::{Provenance, Trade, TradeStatus};
use crate::domain::errors::StoreError;

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Insert an OPEN trade. Returns false, writing nothing, when an OPEN
    /// trade already exists for the same symbol and provenance, or when
    /// `trade` is a reconciliation orphan and any OPEN trade already covers
    /// its symbol and side.
    async fn insert_open(&self, trade: &Trade) -> Result<bool, StoreError>;

    /// Replace a trade that is currently OPEN with `trade`
    async fn update_open(&self, trade: &Trade) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Trade>, StoreError>;

    async fn open_trades(&self) -> Result<Vec<Trade>, StoreError>;

    async fn open_trades_for_symbol(&self, symbol: &str) -> Result<Vec<Trade>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    trades: Mutex<Vec<Trade>>,
}

impl InMemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Trade> {
        self.trades.lock().await.clone()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn insert_open(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut trades = self.trades.lock().await;
        let orphan = trade.provenance == Provenance::ReconciliationOrphan;
        let duplicate = trades.iter().any(|t| {
            t.status == TradeStatus::Open
                && t.symbol == trade.symbol
                && (t.provenance == trade.provenance || (orphan && t.side == trade.side))
        });
        if duplicate {
            return Ok(false);
        }
        trades.push(trade.clone());
        Ok(true)
    }

    async fn update_open(&self, trade: &Trade) -> Result<(), StoreError> {
        let mut trades = self.trades.lock().await;
        let existing = trades
            .iter_mut()
            .find(|t| t.id == trade.id)
            .ok_or_else(|| StoreError::NotFound(trade.id.clone()))?;
        if existing.status != TradeStatus::Open {
            return Err(StoreError::NotOpen(trade.id.clone()));
        }
        *existing = trade.clone();
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Trade>, StoreError> {
        Ok(self.trades.lock().await.iter().find(|t| t.id == id).cloned())
    }

    async fn open_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades
            .lock()
            .await
            .iter()
            .filter(|t| t.is_open())
            .cloned()
            .collect())
    }

    async fn open_trades_for_symbol(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades
            .lock()
            .await
            .iter()
            .filter(|t| t.is_open() && t.symbol == symbol)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::Side;
    use crate::domain::entities::trade::{CloseReason, NewTrade};
    use chrono::Utc;

    fn trade(symbol: &str, provenance: Provenance) -> Trade {
        trade_on(symbol, Side::Long, provenance)
    }

    fn trade_on(symbol: &str, side: Side, provenance: Provenance) -> Trade {
        Trade::open(NewTrade {
            symbol: symbol.to_string(),
            side,
            qty: 1.0,
            entry_price: 100.0,
            leverage: 5,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            fees: 0.0,
            provenance,
            exchange_order_id: None,
            cycle_id: None,
            opened_at: Utc::now(),
        })
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_one_open_trade_per_symbol_and_provenance() {
        let store = InMemoryTradeStore::new();
        assert!(store.insert_open(&trade("BTCUSDT", Provenance::Cycle)).await.unwrap());
        assert!(!store.insert_open(&trade("BTCUSDT", Provenance::Cycle)).await.unwrap());
        assert!(store.insert_open(&trade("BTCUSDT", Provenance::Manual)).await.unwrap());
        assert_eq!(store.open_trades_for_symbol("BTCUSDT").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_orphan_refused_while_symbol_side_is_booked() {
        let store = InMemoryTradeStore::new();
        assert!(store.insert_open(&trade("BTCUSDT", Provenance::Cycle)).await.unwrap());
        assert!(!store
            .insert_open(&trade("BTCUSDT", Provenance::ReconciliationOrphan))
            .await
            .unwrap());
        assert!(store
            .insert_open(&trade_on("BTCUSDT", Side::Short, Provenance::ReconciliationOrphan))
            .await
            .unwrap());
        assert!(store
            .insert_open(&trade("ETHUSDT", Provenance::ReconciliationOrphan))
            .await
            .unwrap());
        assert_eq!(store.open_trades().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_trade_cannot_be_updated() {
        let store = InMemoryTradeStore::new();
        let t = trade("ETHUSDT", Provenance::Cycle);
        store.insert_open(&t).await.unwrap();

        let (closed, _) = t.close(101.0, 0.0, CloseReason::Manual, Utc::now()).unwrap();
        store.update_open(&closed).await.unwrap();
        assert!(store.open_trades().await.unwrap().is_empty());

        assert_eq!(
            store.update_open(&closed).await,
            Err(StoreError::NotOpen(closed.id.clone()))
        );
        // a new OPEN trade for the symbol is allowed again
        assert!(store.insert_open(&trade("ETHUSDT", Provenance::Cycle)).await.unwrap());
    }
}
