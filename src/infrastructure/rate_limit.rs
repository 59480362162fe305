use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::domain::entities::market::{AccountBalance, InstrumentInfo, Kline, OrderSide, Ticker};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangePosition, ExchangeResult, Execution, OcoAck, OcoParams, OrderAck,
    OrderParams,
};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests per second sent to the venue
    pub requests_per_second: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
        }
    }
}

pub type DirectRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(config: &RateLimiterConfig) -> DirectRateLimiter {
    let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
}

/// Paces every call to the wrapped client; callers wait rather than fail
pub struct RateLimitedExchange {
    inner: Arc<dyn ExchangeClient>,
    limiter: DirectRateLimiter,
}

impl RateLimitedExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, config: &RateLimiterConfig) -> Self {
        Self {
            inner,
            limiter: create_rate_limiter(config),
        }
    }

    async fn pace(&self) {
        self.limiter.until_ready().await;
    }
}

#[async_trait]
impl ExchangeClient for RateLimitedExchange {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.pace().await;
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn create_order(&self, params: &OrderParams) -> ExchangeResult<OrderAck> {
        self.pace().await;
        self.inner.create_order(params).await
    }

    async fn create_oco_order(&self, params: &OcoParams) -> ExchangeResult<OcoAck> {
        self.pace().await;
        self.inner.create_oco_order(params).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderAck> {
        self.pace().await;
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn cancel_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<()> {
        self.pace().await;
        self.inner.cancel_oco_order(symbol, oco_id).await
    }

    async fn get_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<OcoAck> {
        self.pace().await;
        self.inner.get_oco_order(symbol, oco_id).await
    }

    async fn kline(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        self.pace().await;
        self.inner.kline(symbol, interval, limit).await
    }

    async fn tickers(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.pace().await;
        self.inner.tickers(symbol).await
    }

    async fn get_instrument_info(&self, symbol: &str) -> ExchangeResult<Option<InstrumentInfo>> {
        self.pace().await;
        self.inner.get_instrument_info(symbol).await
    }

    async fn close_reduce_only_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_link_id: &str,
    ) -> ExchangeResult<OrderAck> {
        self.pace().await;
        self.inner
            .close_reduce_only_market(symbol, side, qty, order_link_id)
            .await
    }

    async fn positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        self.pace().await;
        self.inner.positions().await
    }

    async fn executions(&self, symbol: &str, since: DateTime<Utc>) -> ExchangeResult<Vec<Execution>> {
        self.pace().await;
        self.inner.executions(symbol, since).await
    }

    async fn account_balance(&self) -> ExchangeResult<AccountBalance> {
        self.pace().await;
        self.inner.account_balance().await
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }
}
