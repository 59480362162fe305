//! Market snapshot assembly
//!
//! Builds the frozen per-cycle view of a symbol from the exchange (quote,
//! bars, balance, funding) and the local book (open trade).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::entities::market::{
    average_true_range, Kline, MarketSnapshot, PositionSummary, RiskParams,
};
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::repositories::market_data::{MarketDataError, MarketDataProvider};
use crate::domain::repositories::trade_store::TradeStore;
use crate::domain::services::correlation::log_returns;

pub const ATR_MIN_BARS: usize = 15;
const DEFAULT_BARS: usize = 50;

/// Spread at which the liquidity score reaches zero
const ILLIQUID_SPREAD_BPS: f64 = 50.0;

fn ema(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    Some(
        values[period..]
            .iter()
            .fold(seed, |ema, v| (v - ema) * multiplier + ema),
    )
}

/// Simple-average RSI over the last `period` changes
fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }
    let tail = &values[values.len() - period - 1..];
    let (gain, loss) = tail.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });
    if loss == 0.0 {
        return Some(100.0);
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn stdev(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    Some(var.sqrt())
}

pub fn indicators(bars: &[Kline]) -> BTreeMap<String, f64> {
    let mut sorted: Vec<&Kline> = bars.iter().collect();
    sorted.sort_by_key(|k| k.open_time);
    let closes: Vec<f64> = sorted.iter().map(|k| k.close).collect();

    let mut out = BTreeMap::new();
    if let Some(v) = ema(&closes, 9) {
        out.insert("ema_9".to_string(), v);
    }
    if let Some(v) = ema(&closes, 21) {
        out.insert("ema_21".to_string(), v);
    }
    if let Some(v) = rsi(&closes, 14) {
        out.insert("rsi_14".to_string(), v);
    }
    out
}

pub struct ExchangeMarketData {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    risk: RiskParams,
    interval: String,
    bars: usize,
}

impl ExchangeMarketData {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        risk: RiskParams,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            store,
            risk,
            interval: interval.into(),
            bars: DEFAULT_BARS,
        }
    }

    pub fn with_bars(mut self, bars: usize) -> Self {
        self.bars = bars.max(ATR_MIN_BARS);
        self
    }
}

#[async_trait]
impl MarketDataProvider for ExchangeMarketData {
    async fn snapshot(&self, symbol: &str, cycle_id: &str) -> Result<MarketSnapshot, MarketDataError> {
        let ticker = self.exchange.tickers(symbol).await?;
        let mid = (ticker.bid + ticker.ask) / 2.0;
        let price = if ticker.last_price > 0.0 { ticker.last_price } else { mid };
        if !price.is_finite() || price <= 0.0 {
            return Err(MarketDataError::NoPrice(symbol.to_string()));
        }

        let bars = match self.exchange.kline(symbol, &self.interval, self.bars).await {
            Ok(b) => b,
            Err(e) => {
                warn!(symbol, error = %e, "klines unavailable, snapshot has no ATR");
                Vec::new()
            }
        };
        let atr = average_true_range(&bars, ATR_MIN_BARS);
        let volatility = stdev(&log_returns(&bars));

        let mut indicators = indicators(&bars);
        let liquidity_score = if ticker.bid > 0.0 && ticker.ask >= ticker.bid && mid > 0.0 {
            let spread_bps = (ticker.ask - ticker.bid) / mid * 10_000.0;
            indicators.insert("spread_bps".to_string(), spread_bps);
            Some((1.0 - spread_bps / ILLIQUID_SPREAD_BPS).clamp(0.0, 1.0))
        } else {
            None
        };
        if let Some(a) = atr {
            indicators.insert("atr".to_string(), a);
        }

        let balance = self.exchange.account_balance().await?;
        let open_position = self
            .store
            .open_trades_for_symbol(symbol)
            .await?
            .into_iter()
            .next()
            .map(|t| PositionSummary {
                unrealized_pnl: t.pnl_at(price),
                trade_id: t.id,
                side: t.side,
                qty: t.qty,
                entry_price: t.entry_price,
                stop_loss: t.stop_loss,
                take_profit: t.take_profit,
            });

        debug!(symbol, cycle_id, price, bars = bars.len(), has_position = open_position.is_some(), "snapshot captured");
        Ok(MarketSnapshot {
            cycle_id: cycle_id.to_string(),
            symbol: symbol.to_string(),
            price,
            atr,
            volatility,
            liquidity_score,
            indicators,
            open_position,
            balance,
            risk: self.risk.clone(),
            funding: ticker.funding,
            captured_at: Utc::now(),
            round_summary: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::Ticker;
    use crate::domain::repositories::trade_store::InMemoryTradeStore;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use chrono::Duration;

    fn risk() -> RiskParams {
        RiskParams {
            leverage: 5,
            risk_per_trade: 0.01,
            fee_rate: 0.0006,
            slippage_rate: 0.0005,
        }
    }

    fn bars(n: usize) -> Vec<Kline> {
        let start = Utc::now() - Duration::minutes(5 * n as i64);
        (0..n)
            .map(|i| {
                let c = 100.0 + (i as f64 * 0.5).sin();
                Kline {
                    open_time: start + Duration::minutes(5 * i as i64),
                    open: c,
                    high: c + 0.5,
                    low: c - 0.5,
                    close: c,
                    volume: 10.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_rsi_extremes() {
        let up: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(rsi(&up, 14), Some(100.0));
        let down: Vec<f64> = (0..20).rev().map(|i| i as f64).collect();
        assert!(rsi(&down, 14).unwrap() < 1e-9);
        assert!(rsi(&up[..10], 14).is_none());
    }

    #[test]
    fn test_ema_of_constant_series() {
        assert_eq!(ema(&[5.0; 30], 9), Some(5.0));
    }

    #[tokio::test]
    async fn test_snapshot_fields() {
        let exchange = Arc::new(PaperExchange::new());
        exchange
            .set_ticker(Ticker {
                symbol: "BTCUSDT".to_string(),
                last_price: 100.0,
                bid: 99.9,
                ask: 100.1,
                funding: None,
            })
            .await;
        exchange.set_klines("BTCUSDT", bars(40)).await;
        let md = ExchangeMarketData::new(exchange, Arc::new(InMemoryTradeStore::new()), risk(), "5");

        let snap = md.snapshot("BTCUSDT", "cycle-1").await.unwrap();
        assert_eq!(snap.cycle_id, "cycle-1");
        assert_eq!(snap.price, 100.0);
        assert!(snap.atr.is_some());
        assert!(snap.volatility.is_some());
        // 20 bps spread
        assert!((snap.liquidity_score.unwrap() - 0.6).abs() < 1e-6);
        assert!(snap.indicators.contains_key("rsi_14"));
        assert!(snap.open_position.is_none());
    }

    #[tokio::test]
    async fn test_short_history_has_no_atr() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_price("BTCUSDT", 100.0).await;
        exchange.set_klines("BTCUSDT", bars(10)).await;
        let md = ExchangeMarketData::new(exchange, Arc::new(InMemoryTradeStore::new()), risk(), "5");
        let snap = md.snapshot("BTCUSDT", "c").await.unwrap();
        assert!(snap.atr.is_none());
    }
}
