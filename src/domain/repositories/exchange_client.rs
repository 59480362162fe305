//! Exchange Client Trait
//!
//! This module defines the `ExchangeClient` trait, the only surface through
//! which the trading core talks to a derivatives venue. Wire formats stay in
//! the implementations; the core sees typed requests and a uniform response
//! contract: `Ok(result)` on success, `Err(ExchangeError)` carrying a
//! machine-readable code and a message on failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::entities::market::{
    AccountBalance, InstrumentInfo, Kline, OrderSide, Side, Ticker,
};

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Failure half of the uniform response contract
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    /// The venue answered and refused the request
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    /// The request never got a definitive answer
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    pub const POST_ONLY_REJECT: &'static str = "POST_ONLY_REJECT";
    pub const INSUFFICIENT_MARGIN: &'static str = "INSUFFICIENT_MARGIN";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        ExchangeError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ExchangeError::Rejected { code, .. } => code,
            ExchangeError::Network(_) => "NETWORK",
            ExchangeError::Timeout => "TIMEOUT",
            ExchangeError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    PostOnly,
    Ioc,
    Gtc,
}

/// Parameters for a single order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    /// Client-assigned id; resubmitting the same id must not create a second order
    pub client_order_id: String,
}

/// Status of an order as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::New => write!(f, "New"),
            OrderStatus::PartiallyFilled => write!(f, "PartiallyFilled"),
            OrderStatus::Filled => write!(f, "Filled"),
            OrderStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Success half of the contract for order placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
}

/// Take-profit / stop-loss pair where one fill cancels the other
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcoParams {
    pub symbol: String,
    /// Side of the closing orders
    pub side: OrderSide,
    pub qty: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcoAck {
    pub oco_id: String,
    pub symbol: String,
    pub active: bool,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

/// Open position reported by the venue; `size` is signed (negative = short)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub size: f64,
    pub avg_price: f64,
    pub leverage: Option<u32>,
}

impl ExchangePosition {
    pub fn side(&self) -> Option<Side> {
        if self.size > 0.0 {
            Some(Side::Long)
        } else if self.size < 0.0 {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// A fill reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub order_id: String,
    pub executed_at: DateTime<Utc>,
}

/// Exchange client trait that all venue implementations must implement
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Venue name, used for logging and circuit-breaker keys
    fn name(&self) -> &str;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn create_order(&self, params: &OrderParams) -> ExchangeResult<OrderAck>;

    /// Cancel whatever is left of a resting order. The ack reports the
    /// order's final cumulative fill; cancelling an order that is no longer
    /// live returns its last known state.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderAck>;

    async fn create_oco_order(&self, params: &OcoParams) -> ExchangeResult<OcoAck>;

    async fn cancel_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<()>;

    async fn get_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<OcoAck>;

    /// Bars oldest first
    async fn kline(&self, symbol: &str, interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>>;

    async fn tickers(&self, symbol: &str) -> ExchangeResult<Ticker>;

    async fn get_instrument_info(&self, symbol: &str) -> ExchangeResult<Option<InstrumentInfo>>;

    /// Reduce-only market order closing `qty` of a position
    async fn close_reduce_only_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_link_id: &str,
    ) -> ExchangeResult<OrderAck>;

    async fn positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn executions(&self, symbol: &str, since: DateTime<Utc>)
        -> ExchangeResult<Vec<Execution>>;

    async fn account_balance(&self) -> ExchangeResult<AccountBalance>;

    /// Check if the venue is reachable
    async fn is_healthy(&self) -> bool {
        true
    }
}
