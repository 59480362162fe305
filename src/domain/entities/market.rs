use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::entities::decision::{Action, RoundSummaryEntry};

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_action(action: Action) -> Option<Side> {
        match action {
            Action::Long => Some(Side::Long),
            Action::Short => Some(Side::Short),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_order_side(&self) -> OrderSide {
        self.opposite().entry_order_side()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn position_side(&self) -> Side {
        match self {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

/// Normalized account balance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub equity: f64,
    pub free_collateral: f64,
    /// Used margin divided by equity, 0.0..=1.0
    pub margin_utilization: f64,
}

/// Open position as seen by the local book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub trade_id: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingInfo {
    /// Funding rate per interval as a fraction (0.0001 = 1 bp)
    pub rate: f64,
    pub next_funding_time: DateTime<Utc>,
}

/// Risk parameters in force for the cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    pub leverage: u32,
    pub risk_per_trade: f64,
    pub fee_rate: f64,
    pub slippage_rate: f64,
}

/// Everything a cycle knows about a symbol, frozen at capture time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub cycle_id: String,
    pub symbol: String,
    pub price: f64,
    pub atr: Option<f64>,
    pub volatility: Option<f64>,
    pub liquidity_score: Option<f64>,
    pub indicators: BTreeMap<String, f64>,
    pub open_position: Option<PositionSummary>,
    pub balance: AccountBalance,
    pub risk: RiskParams,
    pub funding: Option<FundingInfo>,
    pub captured_at: DateTime<Utc>,
    /// First-round opinions; only populated for second-round requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_summary: Vec<RoundSummaryEntry>,
}

impl MarketSnapshot {
    /// Copy of this snapshot carrying the first-round summary
    pub fn with_round_summary(&self, summary: Vec<RoundSummaryEntry>) -> MarketSnapshot {
        MarketSnapshot {
            round_summary: summary,
            ..self.clone()
        }
    }
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub funding: Option<FundingInfo>,
}

impl Ticker {
    /// Best price to join the book on the given side
    pub fn best_price(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy if self.bid > 0.0 => self.bid,
            OrderSide::Sell if self.ask > 0.0 => self.ask,
            _ => self.last_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
    pub max_leverage: u32,
}

/// Average true range over consecutive bars, oldest first.
///
/// Returns `None` with fewer than `min_bars` bars.
pub fn average_true_range(bars: &[Kline], min_bars: usize) -> Option<f64> {
    if bars.len() < min_bars.max(2) {
        return None;
    }
    let trs: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let bar = &w[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect();
    let atr = trs.iter().sum::<f64>() / trs.len() as f64;
    (atr.is_finite() && atr > 0.0).then_some(atr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(i: i64, high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: Utc::now() + Duration::minutes(5 * i),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_side_order_sides() {
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
        assert_eq!(OrderSide::Sell.position_side(), Side::Short);
    }

    #[test]
    fn test_atr_requires_min_bars() {
        let bars: Vec<Kline> = (0..10).map(|i| bar(i, 101.0, 99.0, 100.0)).collect();
        assert!(average_true_range(&bars, 15).is_none());
        assert!((average_true_range(&bars, 5).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_atr_uses_previous_close_gap() {
        let bars = vec![bar(0, 101.0, 99.0, 100.0), bar(1, 111.0, 109.0, 110.0)];
        // gap up: |high - prev_close| dominates
        assert!((average_true_range(&bars, 2).unwrap() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_ticker_best_price_falls_back_to_last() {
        let t = Ticker {
            symbol: "BTCUSDT".into(),
            last_price: 100.0,
            bid: 0.0,
            ask: 100.5,
            funding: None,
        };
        assert_eq!(t.best_price(OrderSide::Buy), 100.0);
        assert_eq!(t.best_price(OrderSide::Sell), 100.5);
    }
}
