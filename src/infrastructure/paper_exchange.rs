//! Paper exchange
//!
//! In-memory `ExchangeClient` used for dry runs and tests. Quotes, bars,
//! positions and fills are whatever the caller seeds; orders fill
//! immediately according to [`PaperExchangeConfig`]. Unfilled post-only
//! quantity rests on a paper book until it is cancelled. Client order ids
//! are honoured: resubmitting an accepted id returns the original
//! acknowledgement without a second fill.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::entities::market::{AccountBalance, InstrumentInfo, Kline, OrderSide, Ticker};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangePosition, ExchangeResult, Execution, OcoAck, OcoParams,
    OrderAck, OrderParams, OrderStatus, OrderType, TimeInForce,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PaperExchangeConfig {
    /// Reject every post-only order as if it would cross the book
    pub reject_post_only: bool,
    /// Share of a post-only order filled on arrival; 0 leaves it resting
    pub post_only_fill_ratio: f64,
    /// Share of a limit IOC order filled; the rest is cancelled
    pub ioc_fill_ratio: f64,
    /// Fill ratio for TWAP chunks, defaults to `ioc_fill_ratio`
    pub twap_fill_ratio: Option<f64>,
    /// Share of a resting order's remainder that fills before a cancel lands
    pub resting_fill_ratio: f64,
    /// Every cancel fails as if the venue were unreachable
    pub fail_cancel: bool,
    pub fee_rate: f64,
}

impl Default for PaperExchangeConfig {
    fn default() -> Self {
        Self {
            reject_post_only: false,
            post_only_fill_ratio: 1.0,
            ioc_fill_ratio: 1.0,
            twap_fill_ratio: None,
            resting_fill_ratio: 0.0,
            fail_cancel: false,
            fee_rate: 0.0006,
        }
    }
}

/// Unfilled remainder of a limit order on the paper book
#[derive(Debug, Clone)]
struct RestingOrder {
    params: OrderParams,
    price: f64,
}

#[derive(Default)]
struct PaperState {
    tickers: HashMap<String, Ticker>,
    price_queue: HashMap<String, VecDeque<f64>>,
    klines: HashMap<String, Vec<Kline>>,
    instruments: HashMap<String, InstrumentInfo>,
    leverage: HashMap<String, u32>,
    positions: HashMap<String, ExchangePosition>,
    executions: Vec<Execution>,
    orders: Vec<OrderParams>,
    acks: HashMap<String, OrderAck>,
    resting: HashMap<String, RestingOrder>,
    ocos: Vec<(String, OcoAck)>,
    balance: AccountBalance,
    fail_positions: bool,
    next_id: u64,
}

impl PaperState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    /// Current quote; queued prices are served once each, the last one sticks
    fn quote(&mut self, symbol: &str) -> ExchangeResult<Ticker> {
        let base = self.tickers.get(symbol).cloned();
        if let Some(queue) = self.price_queue.get_mut(symbol) {
            let price = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().copied()
            };
            if let Some(price) = price {
                return Ok(Ticker {
                    symbol: symbol.to_string(),
                    last_price: price,
                    bid: price,
                    ask: price,
                    funding: base.and_then(|t| t.funding),
                });
            }
        }
        base.ok_or_else(|| ExchangeError::rejected(ExchangeError::NOT_FOUND, format!("no ticker for {}", symbol)))
    }

    fn record_fill(&mut self, symbol: &str, side: OrderSide, qty: f64, price: f64, fee_rate: f64, order_id: &str) {
        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| ExchangePosition {
                symbol: symbol.to_string(),
                size: 0.0,
                avg_price: 0.0,
                leverage: None,
            });
        let new_size = position.size + signed;
        if position.size == 0.0 || position.size.signum() == signed.signum() {
            let notional = position.size.abs() * position.avg_price + qty * price;
            position.avg_price = notional / new_size.abs();
        } else if new_size != 0.0 && new_size.signum() != position.size.signum() {
            position.avg_price = price;
        }
        position.size = if new_size.abs() < 1e-12 { 0.0 } else { new_size };
        position.leverage = self.leverage.get(symbol).copied().or(position.leverage);

        self.executions.push(Execution {
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            fee: qty * price * fee_rate,
            order_id: order_id.to_string(),
            executed_at: Utc::now(),
        });
    }
}

pub struct PaperExchange {
    config: PaperExchangeConfig,
    state: Mutex<PaperState>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::with_config(PaperExchangeConfig::default())
    }

    pub fn with_config(config: PaperExchangeConfig) -> Self {
        let state = PaperState {
            balance: AccountBalance {
                equity: 10_000.0,
                free_collateral: 10_000.0,
                margin_utilization: 0.0,
            },
            ..Default::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub async fn set_ticker(&self, ticker: Ticker) {
        self.state.lock().await.tickers.insert(ticker.symbol.clone(), ticker);
    }

    /// Flat quote: bid, ask and last all at `price`
    pub async fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().await;
        let funding = state.tickers.get(symbol).and_then(|t| t.funding.clone());
        state.tickers.insert(
            symbol.to_string(),
            Ticker {
                symbol: symbol.to_string(),
                last_price: price,
                bid: price,
                ask: price,
                funding,
            },
        );
    }

    /// Serve these prices on successive quote requests
    pub async fn queue_prices(&self, symbol: &str, prices: Vec<f64>) {
        self.state
            .lock()
            .await
            .price_queue
            .insert(symbol.to_string(), prices.into());
    }

    pub async fn set_klines(&self, symbol: &str, bars: Vec<Kline>) {
        self.state.lock().await.klines.insert(symbol.to_string(), bars);
    }

    pub async fn set_instrument(&self, info: InstrumentInfo) {
        self.state.lock().await.instruments.insert(info.symbol.clone(), info);
    }

    pub async fn set_balance(&self, balance: AccountBalance) {
        self.state.lock().await.balance = balance;
    }

    pub async fn set_positions(&self, positions: Vec<ExchangePosition>) {
        let mut state = self.state.lock().await;
        state.positions = positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
    }

    pub async fn add_execution(&self, execution: Execution) {
        self.state.lock().await.executions.push(execution);
    }

    pub async fn fail_positions(&self, fail: bool) {
        self.state.lock().await.fail_positions = fail;
    }

    /// Every order submitted, rejected ones included
    pub async fn orders(&self) -> Vec<OrderParams> {
        self.state.lock().await.orders.clone()
    }

    pub async fn oco_orders(&self) -> Vec<OcoAck> {
        self.state.lock().await.ocos.iter().map(|(_, a)| a.clone()).collect()
    }

    /// Acknowledgements of orders still resting on the paper book
    pub async fn resting_orders(&self) -> Vec<OrderAck> {
        let state = self.state.lock().await;
        state
            .resting
            .values()
            .filter_map(|o| state.acks.get(&o.params.client_order_id).cloned())
            .collect()
    }

    pub async fn leverage(&self, symbol: &str) -> Option<u32> {
        self.state.lock().await.leverage.get(symbol).copied()
    }

    fn fill_ratio(&self, params: &OrderParams) -> f64 {
        let ratio = match (params.order_type, params.time_in_force) {
            (OrderType::Market, _) => 1.0,
            (OrderType::Limit, TimeInForce::PostOnly) | (OrderType::Limit, TimeInForce::Gtc) => {
                self.config.post_only_fill_ratio
            }
            (OrderType::Limit, TimeInForce::Ioc) => {
                if params.client_order_id.contains("-twap-") {
                    self.config.twap_fill_ratio.unwrap_or(self.config.ioc_fill_ratio)
                } else {
                    self.config.ioc_fill_ratio
                }
            }
        };
        ratio.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        if leverage == 0 {
            return Err(ExchangeError::rejected("INVALID_LEVERAGE", "leverage must be at least 1"));
        }
        self.state.lock().await.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn create_order(&self, params: &OrderParams) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().await;
        if let Some(ack) = state.acks.get(&params.client_order_id) {
            debug!(client_order_id = %params.client_order_id, "duplicate client id, returning original ack");
            return Ok(ack.clone());
        }
        state.orders.push(params.clone());

        if !params.qty.is_finite() || params.qty <= 0.0 {
            return Err(ExchangeError::rejected("INVALID_QTY", format!("qty {}", params.qty)));
        }
        if params.order_type == OrderType::Limit
            && params.time_in_force == TimeInForce::PostOnly
            && self.config.reject_post_only
        {
            return Err(ExchangeError::rejected(
                ExchangeError::POST_ONLY_REJECT,
                "post-only order would take liquidity",
            ));
        }

        let quote = state.quote(&params.symbol)?;
        let price = match (params.order_type, params.price) {
            (OrderType::Limit, Some(p)) if p > 0.0 => p,
            (OrderType::Limit, _) => {
                return Err(ExchangeError::rejected("INVALID_PRICE", "limit order needs a price"));
            }
            (OrderType::Market, _) => match params.side {
                OrderSide::Buy => quote.ask,
                OrderSide::Sell => quote.bid,
            },
        };

        let ratio = self.fill_ratio(params);
        let filled = params.qty * ratio;
        let order_id = state.next_id("paper");
        let status = if ratio >= 1.0 {
            OrderStatus::Filled
        } else if filled > 0.0 {
            OrderStatus::PartiallyFilled
        } else if params.time_in_force == TimeInForce::Ioc || params.order_type == OrderType::Market {
            OrderStatus::Cancelled
        } else {
            OrderStatus::New
        };
        if filled > 0.0 {
            state.record_fill(&params.symbol, params.side, filled, price, self.config.fee_rate, &order_id);
        }
        if matches!(status, OrderStatus::New | OrderStatus::PartiallyFilled)
            && params.order_type == OrderType::Limit
            && params.time_in_force != TimeInForce::Ioc
        {
            state.resting.insert(
                order_id.clone(),
                RestingOrder {
                    params: params.clone(),
                    price,
                },
            );
        }

        let ack = OrderAck {
            order_id,
            client_order_id: params.client_order_id.clone(),
            status,
            filled_qty: filled,
            avg_price: (filled > 0.0).then_some(price),
        };
        state.acks.insert(params.client_order_id.clone(), ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderAck> {
        if self.config.fail_cancel {
            return Err(ExchangeError::Network("cancel endpoint unavailable".to_string()));
        }
        let mut state = self.state.lock().await;
        let Some(order) = state.resting.remove(order_id) else {
            return state
                .acks
                .values()
                .find(|a| a.order_id == order_id)
                .cloned()
                .ok_or_else(|| ExchangeError::rejected(ExchangeError::NOT_FOUND, format!("order {}", order_id)));
        };
        if order.params.symbol != symbol {
            state.resting.insert(order_id.to_string(), order);
            return Err(ExchangeError::rejected(
                ExchangeError::NOT_FOUND,
                format!("order {} not on {}", order_id, symbol),
            ));
        }

        let client_id = order.params.client_order_id.clone();
        let already = state.acks.get(&client_id).map(|a| a.filled_qty).unwrap_or(0.0);
        let late = (order.params.qty - already).max(0.0) * self.config.resting_fill_ratio.clamp(0.0, 1.0);
        if late > 0.0 {
            state.record_fill(symbol, order.params.side, late, order.price, self.config.fee_rate, order_id);
        }
        let filled = already + late;
        let ack = OrderAck {
            order_id: order_id.to_string(),
            client_order_id: client_id.clone(),
            status: if filled >= order.params.qty {
                OrderStatus::Filled
            } else {
                OrderStatus::Cancelled
            },
            filled_qty: filled,
            avg_price: (filled > 0.0).then_some(order.price),
        };
        debug!(order_id, filled, "resting order cancelled");
        state.acks.insert(client_id, ack.clone());
        Ok(ack)
    }

    async fn create_oco_order(&self, params: &OcoParams) -> ExchangeResult<OcoAck> {
        let mut state = self.state.lock().await;
        if let Some((_, ack)) = state.ocos.iter().find(|(cid, _)| cid == &params.client_order_id) {
            return Ok(ack.clone());
        }
        if params.take_profit.is_none() && params.stop_loss.is_none() {
            return Err(ExchangeError::rejected("INVALID_OCO", "needs a take profit or a stop loss"));
        }
        let ack = OcoAck {
            oco_id: state.next_id("oco"),
            symbol: params.symbol.clone(),
            active: true,
            take_profit: params.take_profit,
            stop_loss: params.stop_loss,
        };
        state.ocos.push((params.client_order_id.clone(), ack.clone()));
        Ok(ack)
    }

    async fn cancel_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        let (_, ack) = state
            .ocos
            .iter_mut()
            .find(|(_, a)| a.oco_id == oco_id && a.symbol == symbol)
            .ok_or_else(|| ExchangeError::rejected(ExchangeError::NOT_FOUND, format!("oco {}", oco_id)))?;
        ack.active = false;
        Ok(())
    }

    async fn get_oco_order(&self, symbol: &str, oco_id: &str) -> ExchangeResult<OcoAck> {
        self.state
            .lock()
            .await
            .ocos
            .iter()
            .find(|(_, a)| a.oco_id == oco_id && a.symbol == symbol)
            .map(|(_, a)| a.clone())
            .ok_or_else(|| ExchangeError::rejected(ExchangeError::NOT_FOUND, format!("oco {}", oco_id)))
    }

    async fn kline(&self, symbol: &str, _interval: &str, limit: usize) -> ExchangeResult<Vec<Kline>> {
        let state = self.state.lock().await;
        let bars = state
            .klines
            .get(symbol)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ExchangeError::rejected(ExchangeError::NOT_FOUND, format!("no klines for {}", symbol)))?;
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }

    async fn tickers(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.state.lock().await.quote(symbol)
    }

    async fn get_instrument_info(&self, symbol: &str) -> ExchangeResult<Option<InstrumentInfo>> {
        Ok(self.state.lock().await.instruments.get(symbol).cloned())
    }

    async fn close_reduce_only_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        order_link_id: &str,
    ) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().await;
        if let Some(ack) = state.acks.get(order_link_id) {
            return Ok(ack.clone());
        }
        let size = state.positions.get(symbol).map(|p| p.size).unwrap_or(0.0);
        let reduces = match side {
            OrderSide::Sell => size > 0.0,
            OrderSide::Buy => size < 0.0,
        };
        if !reduces {
            return Err(ExchangeError::rejected(
                "REDUCE_ONLY_REJECT",
                format!("no position on {} to reduce with {}", symbol, side),
            ));
        }
        let quote = state.quote(symbol)?;
        let price = match side {
            OrderSide::Buy => quote.ask,
            OrderSide::Sell => quote.bid,
        };
        let filled = qty.min(size.abs());
        let order_id = state.next_id("paper");
        state.record_fill(symbol, side, filled, price, self.config.fee_rate, &order_id);
        state.orders.push(OrderParams {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: true,
            client_order_id: order_link_id.to_string(),
        });
        let ack = OrderAck {
            order_id,
            client_order_id: order_link_id.to_string(),
            status: OrderStatus::Filled,
            filled_qty: filled,
            avg_price: Some(price),
        };
        state.acks.insert(order_link_id.to_string(), ack.clone());
        Ok(ack)
    }

    async fn positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let state = self.state.lock().await;
        if state.fail_positions {
            return Err(ExchangeError::Network("positions endpoint unavailable".to_string()));
        }
        let mut positions: Vec<ExchangePosition> = state
            .positions
            .values()
            .filter(|p| p.size != 0.0)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn executions(&self, symbol: &str, since: DateTime<Utc>) -> ExchangeResult<Vec<Execution>> {
        Ok(self
            .state
            .lock()
            .await
            .executions
            .iter()
            .filter(|e| e.symbol == symbol && e.executed_at >= since)
            .cloned()
            .collect())
    }

    async fn account_balance(&self) -> ExchangeResult<AccountBalance> {
        Ok(self.state.lock().await.balance.clone())
    }
}
