use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::entities::market::{OrderSide, Side};

/// Rung of the execution ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderMode {
    PostOnly,
    LimitIoc,
    MarketIoc,
    Twap,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderMode::PostOnly => "POST_ONLY",
            OrderMode::LimitIoc => "LIMIT_IOC",
            OrderMode::MarketIoc => "MARKET_IOC",
            OrderMode::Twap => "TWAP",
        }
    }

    /// Suffix of the client order id for this rung
    pub fn client_suffix(&self) -> &'static str {
        match self {
            OrderMode::PostOnly => "po",
            OrderMode::LimitIoc => "ioc",
            OrderMode::MarketIoc => "mkt",
            OrderMode::Twap => "twap",
        }
    }
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions under which a market IOC is permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardCondition {
    ExtremeVolatility,
    LiquidityCrisis,
    EmergencyExit,
}

impl GuardCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardCondition::ExtremeVolatility => "EXTREME_VOLATILITY",
            GuardCondition::LiquidityCrisis => "LIQUIDITY_CRISIS",
            GuardCondition::EmergencyExit => "EMERGENCY_EXIT",
        }
    }
}

/// Why a rung, or the whole ladder, stopped short
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    SlippageCapEnforced,
    MarketIocNotGuarded,
    CircuitOpen,
    InvalidRequest(String),
    TwapIncomplete,
    NothingFilled,
    /// A resting order could not be cancelled and may still fill
    OrderStillResting,
}

impl AbortReason {
    pub fn code(&self) -> &'static str {
        match self {
            AbortReason::SlippageCapEnforced => "SLIPPAGE_CAP_ENFORCED",
            AbortReason::MarketIocNotGuarded => "MARKET_IOC_NOT_GUARDED",
            AbortReason::CircuitOpen => "CIRCUIT_OPEN",
            AbortReason::InvalidRequest(_) => "INVALID_REQUEST",
            AbortReason::TwapIncomplete => "TWAP_INCOMPLETE",
            AbortReason::NothingFilled => "NOTHING_FILLED",
            AbortReason::OrderStillResting => "ORDER_STILL_RESTING",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InvalidRequest(msg) => write!(f, "INVALID_REQUEST: {}", msg),
            other => f.write_str(other.code()),
        }
    }
}

/// What the ladder is asked to execute
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    /// Prefix for idempotent client order ids, normally the cycle id
    pub client_id_base: String,
    pub slippage_cap_bps: Option<u32>,
    pub guard: Option<GuardCondition>,
    pub reduce_only: bool,
    pub volatility: Option<f64>,
    pub liquidity_score: Option<f64>,
}

impl OrderRequest {
    pub fn order_side(&self) -> OrderSide {
        if self.reduce_only {
            self.side.exit_order_side()
        } else {
            self.side.entry_order_side()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Filled { qty: f64, avg_price: f64 },
    PartiallyFilled { qty: f64, avg_price: f64 },
    Resting,
    /// Resting remainder cancelled; `qty` filled while it rested
    Cancelled { qty: f64 },
    Rejected { code: String, message: String },
    Aborted { reason: AbortReason },
}

/// One exchange interaction made by the ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderAttempt {
    pub mode: OrderMode,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub limit_price: Option<f64>,
    pub outcome: AttemptOutcome,
}

/// Result of one ladder run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    /// Rung that produced the final fill or resting order
    pub order_mode: Option<OrderMode>,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    pub order_ids: Vec<String>,
    pub attempts: Vec<LadderAttempt>,
    pub abort_reason: Option<AbortReason>,
    pub twap_chunks: u32,
}

impl ExecutionReport {
    pub fn remaining(&self, requested: f64) -> f64 {
        (requested - self.filled_qty).max(0.0)
    }

    /// An order from this run may still be live on the venue
    pub fn left_resting(&self) -> bool {
        self.abort_reason == Some(AbortReason::OrderStillResting)
    }
}
