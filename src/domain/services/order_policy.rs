//! Order Execution Policy
//!
//! Turns a sized order into exchange orders through a fixed ladder, one rung
//! at a time:
//!
//! ```text
//! POST_ONLY ──reject──▶ LIMIT_IOC ──reject/partial──▶ [MARKET_IOC] ──▶ TWAP
//! ```
//!
//! MARKET_IOC only runs under an active guard condition. A post-only order
//! that does not fill completely rests for `post_only_wait` and is then
//! cancelled, so the next rung only ever sends what is really unfilled. Every
//! order carries a deterministic client id derived from the request, so
//! resubmitting the same cycle cannot create a second order on the venue.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::entities::market::{OrderSide, Ticker};
use crate::domain::entities::order::{
    AbortReason, AttemptOutcome, ExecutionReport, GuardCondition, LadderAttempt, OrderMode,
    OrderRequest,
};
use crate::domain::errors::ExecutionError;
use crate::domain::policy::ExecutionPolicyConfig;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, OrderAck, OrderParams, OrderStatus, OrderType, TimeInForce,
};
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerError};

/// Tolerance below which a remaining quantity counts as filled
const QTY_EPSILON: f64 = 1e-9;

fn usable_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

enum Step {
    Done,
    Continue,
    Abort(AbortReason),
}

/// Mutable state of one ladder run
struct Run<'a> {
    request: &'a OrderRequest,
    report: ExecutionReport,
    notional: f64,
}

impl<'a> Run<'a> {
    fn new(request: &'a OrderRequest) -> Self {
        Self {
            request,
            report: ExecutionReport {
                success: false,
                order_mode: None,
                filled_qty: 0.0,
                avg_price: None,
                order_ids: Vec::new(),
                attempts: Vec::new(),
                abort_reason: None,
                twap_chunks: 0,
            },
            notional: 0.0,
        }
    }

    fn remaining(&self) -> f64 {
        self.report.remaining(self.request.qty)
    }

    fn is_complete(&self) -> bool {
        self.remaining() <= QTY_EPSILON
    }

    fn client_id(&self, mode: OrderMode) -> String {
        format!("{}-{}", self.request.client_id_base, mode.client_suffix())
    }

    fn record(
        &mut self,
        mode: OrderMode,
        client_order_id: String,
        limit_price: Option<f64>,
        outcome: AttemptOutcome,
        order_id: Option<String>,
    ) {
        if let Some(id) = &order_id {
            self.report.order_ids.push(id.clone());
        }
        self.report.attempts.push(LadderAttempt {
            mode,
            client_order_id,
            order_id,
            limit_price,
            outcome,
        });
    }

    fn add_fill(&mut self, mode: OrderMode, qty: f64, price: f64) {
        self.notional += qty * price;
        self.report.filled_qty += qty;
        if self.report.filled_qty > 0.0 && self.notional > 0.0 {
            self.report.avg_price = Some(self.notional / self.report.filled_qty);
        }
        self.report.order_mode = Some(mode);
    }

    /// Fold an acknowledgement into the running totals
    fn apply_ack(&mut self, mode: OrderMode, ack: &OrderAck, fallback_price: Option<f64>) -> AttemptOutcome {
        let filled = ack.filled_qty.max(0.0);
        if filled <= QTY_EPSILON {
            return if ack.status == OrderStatus::New {
                AttemptOutcome::Resting
            } else {
                AttemptOutcome::Rejected {
                    code: "NOT_FILLED".to_string(),
                    message: format!("{} ended {} without fills", mode, ack.status),
                }
            };
        }

        let price = ack.avg_price.or(fallback_price).unwrap_or(0.0);
        self.add_fill(mode, filled, price);

        if ack.status == OrderStatus::Filled || self.is_complete() {
            AttemptOutcome::Filled {
                qty: filled,
                avg_price: price,
            }
        } else {
            AttemptOutcome::PartiallyFilled {
                qty: filled,
                avg_price: price,
            }
        }
    }

    fn finish(mut self, abort: Option<AbortReason>) -> ExecutionReport {
        self.report.success =
            self.report.filled_qty > QTY_EPSILON || abort == Some(AbortReason::OrderStillResting);
        if self.report.order_mode.is_none() && self.report.success {
            self.report.order_mode = self.report.attempts.last().map(|a| a.mode);
        }
        self.report.abort_reason = match abort {
            Some(reason) => Some(reason),
            None if !self.report.success => Some(AbortReason::NothingFilled),
            None => None,
        };
        self.report
    }
}

pub struct OrderExecutionPolicy {
    exchange: Arc<dyn ExchangeClient>,
    breaker: CircuitBreaker,
    config: ExecutionPolicyConfig,
    qty_step: Option<f64>,
}

impl OrderExecutionPolicy {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        breaker: CircuitBreaker,
        config: ExecutionPolicyConfig,
    ) -> Self {
        Self {
            exchange,
            breaker,
            config,
            qty_step: None,
        }
    }

    /// Round TWAP chunks down to the instrument's quantity step
    pub fn with_qty_step(mut self, step: f64) -> Self {
        if step.is_finite() && step > 0.0 {
            self.qty_step = Some(step);
        }
        self
    }

    pub fn config(&self) -> &ExecutionPolicyConfig {
        &self.config
    }

    fn service(&self) -> String {
        format!("exchange:{}", self.exchange.name())
    }

    /// Guard declared on the request, else one derived from market state
    pub fn effective_guard(&self, request: &OrderRequest) -> Option<GuardCondition> {
        request.guard.or_else(|| {
            if request
                .volatility
                .map_or(false, |v| v > self.config.extreme_volatility)
            {
                Some(GuardCondition::ExtremeVolatility)
            } else if request
                .liquidity_score
                .map_or(false, |l| l < self.config.liquidity_crisis_score)
            {
                Some(GuardCondition::LiquidityCrisis)
            } else {
                None
            }
        })
    }

    fn map_breaker_error(
        &self,
        mode: OrderMode,
        e: CircuitBreakerError<ExchangeError>,
    ) -> ExecutionError {
        match e {
            CircuitBreakerError::OperationFailed(source) => ExecutionError::Rejected { mode, source },
            CircuitBreakerError::Timeout { .. } => ExecutionError::Timeout { mode },
            CircuitBreakerError::CircuitOpen { service, .. } => {
                ExecutionError::CircuitOpen { mode, service }
            }
            // an unreadable breaker blocks like an open one
            CircuitBreakerError::Store(_) => ExecutionError::CircuitOpen {
                mode,
                service: self.service(),
            },
        }
    }

    async fn ticker(&self, mode: OrderMode, symbol: &str) -> Result<Ticker, ExecutionError> {
        let exchange = self.exchange.clone();
        self.breaker
            .call(&self.service(), || async move { exchange.tickers(symbol).await })
            .await
            .map_err(|e| self.map_breaker_error(mode, e))
    }

    async fn cancel(&self, mode: OrderMode, symbol: &str, order_id: &str) -> Result<OrderAck, ExecutionError> {
        let exchange = self.exchange.clone();
        self.breaker
            .call(&self.service(), || async move { exchange.cancel_order(symbol, order_id).await })
            .await
            .map_err(|e| self.map_breaker_error(mode, e))
    }

    async fn place(&self, mode: OrderMode, params: OrderParams) -> Result<OrderAck, ExecutionError> {
        let exchange = self.exchange.clone();
        self.breaker
            .call(&self.service(), || async move { exchange.create_order(&params).await })
            .await
            .map_err(|e| self.map_breaker_error(mode, e))
    }

    /// Record a failed rung; circuit failures end the ladder
    fn on_error(&self, run: &mut Run<'_>, mode: OrderMode, client_id: String, price: Option<f64>, e: ExecutionError) -> Step {
        warn!(symbol = %run.request.symbol, mode = %mode, error = %e, "ladder rung failed");
        match e {
            ExecutionError::CircuitOpen { .. } => {
                run.record(
                    mode,
                    client_id,
                    price,
                    AttemptOutcome::Aborted {
                        reason: AbortReason::CircuitOpen,
                    },
                    None,
                );
                Step::Abort(AbortReason::CircuitOpen)
            }
            ExecutionError::Rejected { source, .. } => {
                run.record(
                    mode,
                    client_id,
                    price,
                    AttemptOutcome::Rejected {
                        code: source.code().to_string(),
                        message: source.to_string(),
                    },
                    None,
                );
                Step::Continue
            }
            ExecutionError::Timeout { .. } => {
                run.record(
                    mode,
                    client_id,
                    price,
                    AttemptOutcome::Rejected {
                        code: "TIMEOUT".to_string(),
                        message: format!("{} timed out", mode),
                    },
                    None,
                );
                Step::Continue
            }
        }
    }

    fn limit_params(&self, run: &Run<'_>, client_id: String, qty: f64, price: f64, tif: TimeInForce) -> OrderParams {
        OrderParams {
            symbol: run.request.symbol.clone(),
            side: run.request.order_side(),
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            time_in_force: tif,
            reduce_only: run.request.reduce_only,
            client_order_id: client_id,
        }
    }

    fn cap_bps(&self, request: &OrderRequest) -> u32 {
        request.slippage_cap_bps.unwrap_or(self.config.slippage_cap_bps)
    }

    /// Marketable limit: best price moved by the slippage cap against us
    fn capped_price(side: OrderSide, best: f64, cap_bps: u32) -> f64 {
        let offset = best * f64::from(cap_bps) / 10_000.0;
        match side {
            OrderSide::Buy => best + offset,
            OrderSide::Sell => (best - offset).max(0.0),
        }
    }

    async fn post_only(&self, run: &mut Run<'_>, best: f64) -> Step {
        let mode = OrderMode::PostOnly;
        let client_id = run.client_id(mode);
        let params = self.limit_params(run, client_id.clone(), run.remaining(), best, TimeInForce::PostOnly);
        match self.place(mode, params).await {
            Ok(ack) => {
                let outcome = run.apply_ack(mode, &ack, Some(best));
                let live = matches!(outcome, AttemptOutcome::Resting | AttemptOutcome::PartiallyFilled { .. });
                let filled = matches!(outcome, AttemptOutcome::Filled { .. });
                run.record(mode, client_id.clone(), Some(best), outcome, Some(ack.order_id.clone()));
                if filled {
                    Step::Done
                } else if live {
                    self.settle_resting(run, client_id, best, &ack).await
                } else {
                    Step::Continue
                }
            }
            Err(e) => self.on_error(run, mode, client_id, Some(best), e),
        }
    }

    /// Give a resting post-only order `post_only_wait` to fill, then cancel
    /// the remainder and account for anything that filled meanwhile. An
    /// order that cannot be cancelled stops the ladder.
    async fn settle_resting(&self, run: &mut Run<'_>, client_id: String, price: f64, ack: &OrderAck) -> Step {
        let mode = OrderMode::PostOnly;
        tokio::time::sleep(self.config.post_only_wait).await;

        match self.cancel(mode, &run.request.symbol, &ack.order_id).await {
            Ok(last) => {
                let late = (last.filled_qty - ack.filled_qty.max(0.0)).max(0.0);
                if late > QTY_EPSILON {
                    run.add_fill(mode, late, last.avg_price.unwrap_or(price));
                }
                debug!(symbol = %run.request.symbol, order_id = %ack.order_id, late, "post-only remainder cancelled");
                run.record(mode, client_id, Some(price), AttemptOutcome::Cancelled { qty: late }, Some(last.order_id));
                if run.is_complete() {
                    Step::Done
                } else {
                    Step::Continue
                }
            }
            Err(e) => {
                warn!(symbol = %run.request.symbol, order_id = %ack.order_id, error = %e, "could not cancel resting post-only order");
                run.record(
                    mode,
                    client_id,
                    Some(price),
                    AttemptOutcome::Aborted {
                        reason: AbortReason::OrderStillResting,
                    },
                    None,
                );
                Step::Abort(AbortReason::OrderStillResting)
            }
        }
    }

    async fn limit_ioc(&self, run: &mut Run<'_>, reference: f64) -> Step {
        let mode = OrderMode::LimitIoc;
        let client_id = run.client_id(mode);
        let side = run.request.order_side();
        let cap = self.cap_bps(run.request);

        let current = match self.ticker(mode, &run.request.symbol).await {
            Ok(t) => t.best_price(side),
            Err(e) => return self.on_error(run, mode, client_id, None, e),
        };
        if !usable_price(current) {
            run.record(
                mode,
                client_id,
                None,
                AttemptOutcome::Rejected {
                    code: "INVALID_PRICE".to_string(),
                    message: format!("quote {} is not usable", current),
                },
                None,
            );
            return Step::Continue;
        }
        let slippage_bps = (current - reference).abs() / reference * 10_000.0;
        if slippage_bps > f64::from(cap) {
            info!(
                symbol = %run.request.symbol,
                slippage_bps,
                cap_bps = cap,
                reason = AbortReason::SlippageCapEnforced.code(),
                "price moved beyond slippage cap, skipping limit IOC"
            );
            run.record(
                mode,
                client_id,
                None,
                AttemptOutcome::Aborted {
                    reason: AbortReason::SlippageCapEnforced,
                },
                None,
            );
            return Step::Continue;
        }

        let price = Self::capped_price(side, reference, cap);
        let params = self.limit_params(run, client_id.clone(), run.remaining(), price, TimeInForce::Ioc);
        match self.place(mode, params).await {
            Ok(ack) => {
                let outcome = run.apply_ack(mode, &ack, Some(price));
                let step = if matches!(outcome, AttemptOutcome::Filled { .. }) {
                    Step::Done
                } else {
                    Step::Continue
                };
                run.record(mode, client_id, Some(price), outcome, Some(ack.order_id));
                step
            }
            Err(e) => self.on_error(run, mode, client_id, Some(price), e),
        }
    }

    async fn market_ioc(&self, run: &mut Run<'_>, guard: Option<GuardCondition>) -> Step {
        let mode = OrderMode::MarketIoc;
        let client_id = run.client_id(mode);
        let Some(guard) = guard else {
            debug!(symbol = %run.request.symbol, "market IOC not guarded, skipping");
            run.record(
                mode,
                client_id,
                None,
                AttemptOutcome::Aborted {
                    reason: AbortReason::MarketIocNotGuarded,
                },
                None,
            );
            return Step::Continue;
        };

        warn!(symbol = %run.request.symbol, guard = guard.as_str(), "market IOC permitted by guard");
        let params = OrderParams {
            symbol: run.request.symbol.clone(),
            side: run.request.order_side(),
            order_type: OrderType::Market,
            qty: run.remaining(),
            price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: run.request.reduce_only,
            client_order_id: client_id.clone(),
        };
        match self.place(mode, params).await {
            Ok(ack) => {
                let outcome = run.apply_ack(mode, &ack, None);
                let step = if matches!(outcome, AttemptOutcome::Filled { .. }) {
                    Step::Done
                } else {
                    Step::Continue
                };
                run.record(mode, client_id, None, outcome, Some(ack.order_id));
                step
            }
            Err(e) => self.on_error(run, mode, client_id, None, e),
        }
    }

    fn chunk_size(&self, total: f64) -> f64 {
        let fraction = self.config.twap_chunk_fraction.clamp(0.01, 1.0);
        let chunk = total * fraction;
        match self.qty_step {
            Some(step) => {
                let floored = (chunk / step + 1e-9).floor() * step;
                if floored > 0.0 {
                    floored
                } else {
                    total
                }
            }
            None => chunk,
        }
    }

    async fn twap(&self, run: &mut Run<'_>) -> Step {
        let mode = OrderMode::Twap;
        let side = run.request.order_side();
        let cap = self.cap_bps(run.request);
        let total = run.remaining();
        let chunk = self.chunk_size(total);
        let max_chunks = (total / chunk).ceil().max(1.0) as u32;

        for i in 0..max_chunks {
            if run.is_complete() {
                break;
            }
            if i > 0 {
                // paced by the timer, never a busy loop
                tokio::time::sleep(self.config.twap_chunk_interval).await;
            }

            let client_id = format!("{}-{}-{}", run.request.client_id_base, mode.client_suffix(), i);
            let qty = if i + 1 == max_chunks {
                run.remaining()
            } else {
                chunk.min(run.remaining())
            };
            run.report.twap_chunks += 1;

            let best = match self.ticker(mode, &run.request.symbol).await {
                Ok(t) => t.best_price(side),
                Err(e) => match self.on_error(run, mode, client_id, None, e) {
                    Step::Abort(reason) => return Step::Abort(reason),
                    _ => continue,
                },
            };
            if !usable_price(best) {
                warn!(symbol = %run.request.symbol, chunk = i, price = best, "no usable quote, skipping TWAP chunk");
                run.record(
                    mode,
                    client_id,
                    None,
                    AttemptOutcome::Rejected {
                        code: "INVALID_PRICE".to_string(),
                        message: format!("quote {} is not usable", best),
                    },
                    None,
                );
                continue;
            }
            let price = Self::capped_price(side, best, cap);
            let params = self.limit_params(run, client_id.clone(), qty, price, TimeInForce::Ioc);
            match self.place(mode, params).await {
                Ok(ack) => {
                    let outcome = run.apply_ack(mode, &ack, Some(price));
                    debug!(symbol = %run.request.symbol, chunk = i, ?outcome, "TWAP chunk sent");
                    run.record(mode, client_id, Some(price), outcome, Some(ack.order_id));
                }
                Err(e) => {
                    if let Step::Abort(reason) = self.on_error(run, mode, client_id, Some(price), e) {
                        return Step::Abort(reason);
                    }
                }
            }
        }

        if run.is_complete() {
            Step::Done
        } else if run.report.filled_qty > QTY_EPSILON {
            Step::Abort(AbortReason::TwapIncomplete)
        } else {
            Step::Abort(AbortReason::NothingFilled)
        }
    }

    /// Run the ladder for `request`
    ///
    /// Never returns an error: rejections move to the next rung and the
    /// report says how far the ladder got.
    pub async fn execute(&self, request: &OrderRequest) -> ExecutionReport {
        let mut run = Run::new(request);

        if !request.qty.is_finite() || request.qty <= 0.0 {
            return run.finish(Some(AbortReason::InvalidRequest(format!(
                "qty must be positive, got {}",
                request.qty
            ))));
        }
        if request.symbol.trim().is_empty() || request.client_id_base.trim().is_empty() {
            return run.finish(Some(AbortReason::InvalidRequest(
                "symbol and client id base are required".to_string(),
            )));
        }

        let guard = self.effective_guard(request);
        let side = request.order_side();
        let reference = match self.ticker(OrderMode::PostOnly, &request.symbol).await {
            Ok(t) => t.best_price(side),
            Err(e) => {
                let client_id = run.client_id(OrderMode::PostOnly);
                let abort = match self.on_error(&mut run, OrderMode::PostOnly, client_id, None, e) {
                    Step::Abort(reason) => reason,
                    _ => AbortReason::NothingFilled,
                };
                return run.finish(Some(abort));
            }
        };
        if !usable_price(reference) {
            return run.finish(Some(AbortReason::InvalidRequest(format!(
                "no usable price for {}",
                request.symbol
            ))));
        }

        let mut abort = None;
        let steps = [OrderMode::PostOnly, OrderMode::LimitIoc, OrderMode::MarketIoc, OrderMode::Twap];
        for mode in steps {
            let step = match mode {
                OrderMode::PostOnly => self.post_only(&mut run, reference).await,
                OrderMode::LimitIoc => self.limit_ioc(&mut run, reference).await,
                OrderMode::MarketIoc => self.market_ioc(&mut run, guard).await,
                OrderMode::Twap => self.twap(&mut run).await,
            };
            match step {
                Step::Done => break,
                Step::Continue => {}
                Step::Abort(reason) => {
                    abort = Some(reason);
                    break;
                }
            }
        }

        let report = run.finish(abort);
        info!(
            symbol = %request.symbol,
            client_id = %request.client_id_base,
            success = report.success,
            mode = report.order_mode.map(|m| m.as_str()).unwrap_or("-"),
            filled_qty = report.filled_qty,
            abort = report.abort_reason.as_ref().map(|a| a.code()).unwrap_or("-"),
            "order ladder finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::Side;
    use crate::domain::repositories::kv_store::InMemoryKvStore;
    use crate::domain::services::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::infrastructure::paper_exchange::{PaperExchange, PaperExchangeConfig};
    use std::time::Duration;

    fn request(qty: f64) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty,
            client_id_base: "cycle-7".to_string(),
            slippage_cap_bps: None,
            guard: None,
            reduce_only: false,
            volatility: Some(0.01),
            liquidity_score: Some(0.9),
        }
    }

    async fn setup(config: PaperExchangeConfig) -> (OrderExecutionPolicy, Arc<PaperExchange>, CircuitBreaker) {
        let exchange = Arc::new(PaperExchange::with_config(config));
        exchange.set_price("BTCUSDT", 50_000.0).await;
        let breaker = CircuitBreaker::new(Arc::new(InMemoryKvStore::new()), CircuitBreakerConfig::default());
        let policy = OrderExecutionPolicy::new(
            exchange.clone(),
            breaker.clone(),
            ExecutionPolicyConfig {
                twap_chunk_interval: Duration::from_millis(5),
                post_only_wait: Duration::from_millis(5),
                ..Default::default()
            },
        );
        (policy, exchange, breaker)
    }

    #[tokio::test]
    async fn test_post_only_fill_ends_ladder() {
        let (policy, exchange, _) = setup(PaperExchangeConfig::default()).await;
        let report = policy.execute(&request(0.1)).await;
        assert!(report.success);
        assert_eq!(report.order_mode, Some(OrderMode::PostOnly));
        assert!((report.filled_qty - 0.1).abs() < 1e-12);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(exchange.orders().await[0].client_order_id, "cycle-7-po");
    }

    #[tokio::test]
    async fn test_post_only_reject_falls_to_limit_ioc() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(0.1)).await;
        assert!(report.success);
        assert_eq!(report.order_mode, Some(OrderMode::LimitIoc));
        assert!(matches!(report.attempts[0].outcome, AttemptOutcome::Rejected { .. }));
        let ioc = &exchange.orders().await[1];
        assert_eq!(ioc.client_order_id, "cycle-7-ioc");
        // 50 bps above the reference bid
        assert!((ioc.price.unwrap() - 50_000.0 * 1.005).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_partial_post_only_is_cancelled_before_ioc() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            post_only_fill_ratio: 0.4,
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(1.0)).await;

        assert!(report.success);
        assert!((report.filled_qty - 1.0).abs() < 1e-9);
        assert!(report
            .attempts
            .iter()
            .any(|a| a.mode == OrderMode::PostOnly && a.outcome == AttemptOutcome::Cancelled { qty: 0.0 }));
        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].client_order_id, "cycle-7-ioc");
        assert!((orders[1].qty - 0.6).abs() < 1e-9);
        // nothing is left on the book to overfill the position later
        assert!(exchange.resting_orders().await.is_empty());
        assert!((exchange.positions().await.unwrap()[0].size - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fill_while_resting_shrinks_next_rung() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            post_only_fill_ratio: 0.0,
            resting_fill_ratio: 0.5,
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(1.0)).await;

        assert!(report.success);
        assert!((report.filled_qty - 1.0).abs() < 1e-9);
        assert!(report
            .attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Cancelled { qty: 0.5 }));
        let ioc = &exchange.orders().await[1];
        assert!((ioc.qty - 0.5).abs() < 1e-9);
        assert!(exchange.resting_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_uncancellable_resting_order_stops_ladder() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            post_only_fill_ratio: 0.0,
            fail_cancel: true,
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(1.0)).await;

        assert!(report.success);
        assert!(report.left_resting());
        assert_eq!(report.filled_qty, 0.0);
        assert_eq!(report.order_mode, Some(OrderMode::PostOnly));
        assert_eq!(exchange.orders().await.len(), 1);
        assert_eq!(exchange.resting_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_twap_skips_chunks_without_a_usable_quote() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            ioc_fill_ratio: 0.0,
            twap_fill_ratio: Some(1.0),
            ..Default::default()
        })
        .await;
        // reference, IOC check and IOC fill quotes are fine, the first TWAP quote is zero
        exchange
            .queue_prices("BTCUSDT", vec![50_000.0, 50_000.0, 50_000.0, 0.0, 50_000.0])
            .await;
        let report = policy.execute(&request(1.0)).await;

        assert!(report.attempts.iter().any(|a| a.mode == OrderMode::Twap
            && matches!(&a.outcome, AttemptOutcome::Rejected { code, .. } if code == "INVALID_PRICE")));
        let orders = exchange.orders().await;
        assert!(orders.iter().all(|o| o.price.map_or(true, |p| p > 0.0)));
        assert!(!orders.iter().any(|o| o.client_order_id == "cycle-7-twap-0"));
        assert!(orders.iter().any(|o| o.client_order_id == "cycle-7-twap-1"));
    }

    #[tokio::test]
    async fn test_partial_ioc_goes_to_twap_without_market_order() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            ioc_fill_ratio: 0.5,
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(1.0)).await;

        assert!(report.success);
        assert_eq!(report.order_mode, Some(OrderMode::Twap));
        assert!(report.twap_chunks >= 1);
        assert!(report
            .attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Aborted { reason: AbortReason::MarketIocNotGuarded }));
        let orders = exchange.orders().await;
        assert!(orders.iter().all(|o| o.order_type != OrderType::Market));
        assert!(orders.iter().any(|o| o.client_order_id == "cycle-7-twap-0"));
        // every chunk still only half-fills, so the ladder cannot finish the order
        assert_eq!(report.abort_reason, Some(AbortReason::TwapIncomplete));
        assert!(report.filled_qty > 0.5);
    }

    #[tokio::test]
    async fn test_twap_chunks_are_quarters() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            ioc_fill_ratio: 0.0,
            twap_fill_ratio: Some(1.0),
            ..Default::default()
        })
        .await;
        let report = policy.execute(&request(1.0)).await;
        assert!(report.success);
        assert_eq!(report.twap_chunks, 4);
        assert!((report.filled_qty - 1.0).abs() < 1e-9);
        let chunks: Vec<f64> = exchange
            .orders()
            .await
            .iter()
            .filter(|o| o.client_order_id.contains("-twap-"))
            .map(|o| o.qty)
            .collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|q| (q - 0.25).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_guard_allows_market_ioc() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            ioc_fill_ratio: 0.0,
            ..Default::default()
        })
        .await;
        let mut req = request(0.2);
        req.volatility = Some(0.08);
        assert_eq!(policy.effective_guard(&req), Some(GuardCondition::ExtremeVolatility));

        let report = policy.execute(&req).await;
        assert!(report.success);
        assert_eq!(report.order_mode, Some(OrderMode::MarketIoc));
        assert!(exchange
            .orders()
            .await
            .iter()
            .any(|o| o.client_order_id == "cycle-7-mkt" && o.order_type == OrderType::Market));
    }

    #[tokio::test]
    async fn test_slippage_cap_skips_limit_ioc() {
        let (policy, exchange, _) = setup(PaperExchangeConfig {
            reject_post_only: true,
            twap_fill_ratio: Some(1.0),
            ..Default::default()
        })
        .await;
        // the price jumps 1% between the reference quote and the IOC rung
        exchange.queue_prices("BTCUSDT", vec![50_000.0, 50_500.0]).await;
        let report = policy.execute(&request(0.1)).await;
        assert!(report
            .attempts
            .iter()
            .any(|a| a.mode == OrderMode::LimitIoc
                && a.outcome == AttemptOutcome::Aborted { reason: AbortReason::SlippageCapEnforced }));
        assert_eq!(report.order_mode, Some(OrderMode::Twap));
    }

    #[tokio::test]
    async fn test_open_circuit_aborts_before_any_order() {
        let (policy, exchange, breaker) = setup(PaperExchangeConfig::default()).await;
        breaker
            .force_state("exchange:paper", CircuitState::Open)
            .await
            .unwrap();
        let report = policy.execute(&request(0.1)).await;
        assert!(!report.success);
        assert_eq!(report.abort_reason, Some(AbortReason::CircuitOpen));
        assert!(exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_quantity_rejected() {
        let (policy, _, _) = setup(PaperExchangeConfig::default()).await;
        let report = policy.execute(&request(0.0)).await;
        assert!(!report.success);
        assert!(matches!(report.abort_reason, Some(AbortReason::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_resubmitting_same_cycle_is_idempotent() {
        let (policy, exchange, _) = setup(PaperExchangeConfig::default()).await;
        let first = policy.execute(&request(0.1)).await;
        let second = policy.execute(&request(0.1)).await;
        assert_eq!(first.order_ids, second.order_ids);
        assert_eq!(exchange.orders().await.len(), 1);
    }
}
