use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::market::MarketSnapshot;
use crate::domain::errors::StoreError;
use crate::domain::repositories::exchange_client::ExchangeError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("Exchange query failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No usable price for {0}")]
    NoPrice(String),
}

/// Source of the frozen per-cycle view of a symbol
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self, symbol: &str, cycle_id: &str) -> Result<MarketSnapshot, MarketDataError>;
}
