//! Trading Cycle Runner
//!
//! One cycle per symbol, serialized by a short-TTL lease:
//!
//! ```text
//! lease ─▶ snapshot ─▶ consensus ─▶ veto limiter ─▶ audit
//!        ─▶ stops ─▶ sizing ─▶ risk gate ─▶ ladder ─▶ Trade
//! ```
//!
//! A symbol that already holds an OPEN trade takes the manage path instead:
//! a two-round consensus that resolves to HOLD, AMEND or CLOSE.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::entities::decision::Action;
use crate::domain::entities::market::{MarketSnapshot, Side};
use crate::domain::entities::order::{AbortReason, ExecutionReport, OrderRequest};
use crate::domain::entities::trade::{validate_levels, CloseReason, NewTrade, Provenance, Trade};
use crate::domain::errors::{AuditError, KvError, StoreError, TradeTransitionError};
use crate::domain::policy::SafetyPolicy;
use crate::domain::repositories::ai_provider::AiProvider;
use crate::domain::repositories::alert_dispatcher::{Alert, AlertDispatcher, AlertLevel};
use crate::domain::repositories::audit_sink::DecisionAuditSink;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError};
use crate::domain::repositories::kv_store::KvStore;
use crate::domain::repositories::market_data::{MarketDataError, MarketDataProvider};
use crate::domain::repositories::trade_store::TradeStore;
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::domain::services::consensus::{ConsensusEngine, ConsensusResult, ConsensusRun, VetoReason};
use crate::domain::services::correlation::CorrelationService;
use crate::domain::services::funding_guard::FundingGuard;
use crate::domain::services::gap_detector::GapDetector;
use crate::domain::services::lease_lock::LeaseLock;
use crate::domain::services::order_policy::OrderExecutionPolicy;
use crate::domain::services::position_sizer::{PositionSizer, RiskSizingRequest};
use crate::domain::services::risk_gate::{OpenCandidate, RiskGate, RiskVerdict};
use crate::domain::services::stop_calculator::StopCalculator;
use crate::domain::services::trade_effects::TradeEffects;
use crate::domain::services::veto_limiter::VetoLimiter;

pub const CONSENSUS_VETO_LIMIT: &str = "CONSENSUS_VETO_LIMIT";
pub const RISK_GATE_BLOCK: &str = "RISK_GATE_BLOCK";
pub const TRADE_OPEN_FAILED: &str = "TRADE_OPEN_FAILED";
pub const TRADE_CLOSE_FAILED: &str = "TRADE_CLOSE_FAILED";
pub const FEED_GAP: &str = "FEED_GAP";
pub const ORDER_RESTING: &str = "ORDER_RESTING";

const PENDING_ORDER_NAMESPACE: &str = "pending_order";

/// Bounds of the provider quantity multiplier `1 + qty_delta_factor`
const QTY_MULTIPLIER_MIN: f64 = 0.25;
const QTY_MULTIPLIER_MAX: f64 = 2.0;

/// Failures that end a cycle early. Business rejections are [`CycleOutcome`]s.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Market data unavailable: {0}")]
    MarketData(#[from] MarketDataError),

    #[error("Trade store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decision audit failed: {0}")]
    Audit(#[from] AuditError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Transition(#[from] TradeTransitionError),
}

/// What the manage path did with an OPEN trade
#[derive(Debug, Clone, PartialEq)]
pub enum ManageAction {
    Hold { reason: String },
    Amended(Trade),
    Closed(Trade),
    CloseFailed { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle holds the symbol's lease
    Busy,
    /// Vetoes reached the limit; no new opens for now
    ManageOnly,
    /// Consensus did not ask for a new position
    NoAction {
        action: Action,
        veto: Option<VetoReason>,
    },
    RiskRejected(RiskVerdict),
    /// Sizing produced no tradable quantity
    SizedToZero,
    /// An order could not be cancelled and may still fill; opens wait
    /// until it fills or its marker expires
    OrderResting { order_ids: Vec<String> },
    ExecutionFailed(ExecutionReport),
    Opened(Trade),
    /// Filled on the exchange but not booked; reconciliation adopts it
    OpenFailed { reason: String },
    Managed(ManageAction),
}

/// Everything a cycle needs, wired by the caller
pub struct CycleComponents {
    pub providers: Vec<Arc<dyn AiProvider>>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub engine: ConsensusEngine,
    pub veto_limiter: VetoLimiter,
    pub lease: LeaseLock,
    pub audit: Arc<dyn DecisionAuditSink>,
    pub sizer: PositionSizer,
    pub stops: StopCalculator,
    pub risk_gate: RiskGate,
    pub ladder: OrderExecutionPolicy,
    pub effects: TradeEffects,
    /// Holds pending-order markers
    pub kv: Arc<dyn KvStore>,
}

pub struct CycleRunner {
    components: CycleComponents,
    gaps: Option<Arc<GapDetector>>,
}

impl CycleRunner {
    pub fn new(components: CycleComponents) -> Self {
        Self {
            components,
            gaps: None,
        }
    }

    /// Standard wiring of every service from one safety policy
    #[allow(clippy::too_many_arguments)]
    pub fn from_policy(
        policy: &SafetyPolicy,
        providers: Vec<Arc<dyn AiProvider>>,
        market_data: Arc<dyn MarketDataProvider>,
        exchange: Arc<dyn ExchangeClient>,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn TradeStore>,
        audit: Arc<dyn DecisionAuditSink>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Self {
        let breaker = CircuitBreaker::new(kv.clone(), CircuitBreakerConfig::default());
        let correlation = Arc::new(CorrelationService::new(
            exchange.clone(),
            policy.risk.correlation_bars,
            policy.risk.correlation_interval.clone(),
        ));
        Self::new(CycleComponents {
            providers,
            market_data,
            engine: ConsensusEngine::new(policy.consensus.clone())
                .with_policy_version(policy.version.clone())
                .with_circuit_breaker(breaker.clone()),
            veto_limiter: VetoLimiter::from_policy(kv.clone(), &policy.consensus),
            lease: LeaseLock::for_cycles(kv.clone()),
            audit,
            sizer: PositionSizer::new(policy.sizing.clone()),
            stops: StopCalculator::new(policy.stops.clone()),
            risk_gate: RiskGate::new(policy.risk.clone(), correlation),
            ladder: OrderExecutionPolicy::new(exchange.clone(), breaker, policy.execution.clone()),
            effects: TradeEffects::new(exchange.clone(), store, alerts),
            exchange,
            kv,
        })
    }

    /// Observe snapshot timestamps and alert on feed gaps
    pub fn with_gap_detector(mut self, gaps: Arc<GapDetector>) -> Self {
        self.gaps = Some(gaps);
        self
    }

    pub fn lease(&self) -> &LeaseLock {
        &self.components.lease
    }

    pub fn veto_limiter(&self) -> &VetoLimiter {
        &self.components.veto_limiter
    }

    fn alerts(&self) -> &Arc<dyn AlertDispatcher> {
        self.components.effects.alerts()
    }

    /// Run one cycle for `symbol`
    pub async fn run_symbol(&self, symbol: &str) -> Result<CycleOutcome, CycleError> {
        let symbol = symbol.to_uppercase();
        match self
            .components
            .lease
            .with_lease(&symbol, || self.run_locked(&symbol))
            .await?
        {
            Some(outcome) => outcome,
            None => {
                debug!(symbol = %symbol, "cycle already running");
                Ok(CycleOutcome::Busy)
            }
        }
    }

    async fn run_locked(&self, symbol: &str) -> Result<CycleOutcome, CycleError> {
        let c = &self.components;
        let cycle_id = Uuid::new_v4().to_string();

        let open = c.effects.store().open_trades_for_symbol(symbol).await?;
        if open.is_empty() && c.veto_limiter.is_manage_only(symbol).await? {
            info!(symbol, "symbol is manage-only, skipping open cycle");
            return Ok(CycleOutcome::ManageOnly);
        }
        if open.is_empty() {
            if let Some(ids) = c.kv.get(&pending_order_key(symbol)).await? {
                info!(symbol, order_ids = %ids, "order from an earlier cycle may still fill, skipping open cycle");
                return Ok(CycleOutcome::OrderResting {
                    order_ids: ids.split(',').filter(|id| !id.is_empty()).map(str::to_string).collect(),
                });
            }
        }

        let snapshot = c.market_data.snapshot(symbol, &cycle_id).await?;
        self.check_feed_gap(&snapshot).await;

        match open.into_iter().next() {
            Some(trade) => self.manage(&snapshot, trade).await,
            None => self.open(&snapshot).await,
        }
    }

    async fn check_feed_gap(&self, snapshot: &MarketSnapshot) {
        let Some(gaps) = &self.gaps else {
            return;
        };
        if let Some(report) = gaps.check_symbol(&snapshot.symbol, snapshot.captured_at).await {
            self.alerts()
                .send(
                    Alert::new(
                        AlertLevel::Warn,
                        FEED_GAP,
                        format!(
                            "{} feed gap of {:.1}s, backfill required",
                            report.symbol, report.gap_seconds
                        ),
                    )
                    .with_context(json!({
                        "backfill_from": report.backfill_from,
                        "backfill_to": report.backfill_to,
                    }))
                    .with_dedup_key(format!("{}:{}", FEED_GAP, report.symbol)),
                )
                .await;
        }
        gaps.observe(&snapshot.symbol, snapshot.captured_at).await;
    }

    /// Persist the audit trail, then count a veto if there was one
    async fn record(&self, run: &ConsensusRun) -> Result<(), CycleError> {
        let c = &self.components;
        c.audit
            .append(&c.engine.audit_records(run, Utc::now()))
            .await?;

        let result = &run.result;
        if let Some(veto) = &result.veto {
            let count = c
                .veto_limiter
                .record_veto(&result.symbol, veto.code.as_str())
                .await?;
            if count.tripped {
                self.alerts()
                    .send(
                        Alert::new(
                            AlertLevel::Critical,
                            CONSENSUS_VETO_LIMIT,
                            format!(
                                "{} reached {} consensus vetoes, new opens blocked",
                                result.symbol, count.count
                            ),
                        )
                        .with_context(json!({
                            "cycle_id": result.cycle_id,
                            "last_veto": veto.code.code(),
                        }))
                        .with_dedup_key(format!("{}:{}", CONSENSUS_VETO_LIMIT, result.symbol)),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn open(&self, snapshot: &MarketSnapshot) -> Result<CycleOutcome, CycleError> {
        let c = &self.components;
        let run = c.engine.run(&c.providers, snapshot, false).await;
        self.record(&run).await?;
        let result = run.result;

        let side = match Side::from_action(result.action) {
            Some(side) => side,
            None => {
                return Ok(CycleOutcome::NoAction {
                    action: result.action,
                    veto: result.veto,
                })
            }
        };
        if c.veto_limiter.is_manage_only(&snapshot.symbol).await? {
            return Ok(CycleOutcome::ManageOnly);
        }

        let price = snapshot.price;
        let computed = match c.stops.compute(&snapshot.symbol, side, price, snapshot.atr, None) {
            Ok(levels) => levels,
            Err(e) => {
                warn!(symbol = %snapshot.symbol, error = %e, "could not price stops");
                return Ok(CycleOutcome::SizedToZero);
            }
        };
        let (stop_loss, take_profit) = consensus_levels(&result, side, price)
            .unwrap_or((computed.stop_loss, computed.take_profit));

        let leverage = result.leverage.unwrap_or(snapshot.risk.leverage).max(1);
        let sizer = match c.exchange.get_instrument_info(&snapshot.symbol).await {
            Ok(Some(info)) => c.sizer.for_instrument(&info),
            Ok(None) => c.sizer.clone(),
            Err(e) => {
                debug!(symbol = %snapshot.symbol, error = %e, "instrument info unavailable, using policy steps");
                c.sizer.clone()
            }
        };

        let balance = &snapshot.balance;
        let im = sizer.size_by_im_cap(
            balance.equity,
            balance.margin_utilization,
            balance.free_collateral,
            leverage,
            price,
        );
        let leverage = im.leverage;
        let by_risk = sizer.size_by_risk(&RiskSizingRequest {
            side,
            entry: price,
            stop_loss,
            equity: balance.equity,
            leverage,
            risk_pct: snapshot.risk.risk_per_trade,
            fee_rate: snapshot.risk.fee_rate,
            slippage_rate: snapshot.risk.slippage_rate,
        });
        let multiplier = (1.0 + result.qty_delta_factor).clamp(QTY_MULTIPLIER_MIN, QTY_MULTIPLIER_MAX)
            * FundingGuard::size_adjustment_factor(snapshot.funding.as_ref(), snapshot.captured_at);
        let qty = sizer.floor_to_step(by_risk.min(im.qty) * multiplier);
        debug!(
            symbol = %snapshot.symbol,
            by_risk,
            im_cap = im.qty,
            risk_band = %im.risk_band,
            multiplier,
            qty,
            "sized order"
        );
        if qty <= 0.0 {
            info!(symbol = %snapshot.symbol, cycle_id = %snapshot.cycle_id, "order sized to zero");
            return Ok(CycleOutcome::SizedToZero);
        }

        let open_symbols: Vec<String> = c
            .effects
            .store()
            .open_trades()
            .await?
            .into_iter()
            .map(|t| t.symbol)
            .collect();
        let verdict = c
            .risk_gate
            .allow_open_with_guards(&OpenCandidate {
                symbol: snapshot.symbol.clone(),
                side,
                entry: price,
                leverage,
                stop_loss,
                funding: snapshot.funding.clone(),
                open_symbols,
                now: snapshot.captured_at,
            })
            .await;
        if !verdict.ok {
            let code = verdict.reason_code.clone().unwrap_or_default();
            warn!(symbol = %snapshot.symbol, gate = ?verdict.gate, code = %code, "risk gate rejected open");
            self.alerts()
                .send(
                    Alert::new(
                        AlertLevel::Warn,
                        RISK_GATE_BLOCK,
                        format!("{} {} blocked: {}", side, snapshot.symbol, verdict.message),
                    )
                    .with_context(json!({
                        "cycle_id": snapshot.cycle_id,
                        "gate": verdict.gate.map(|g| g.to_string()),
                        "code": code,
                    }))
                    .with_dedup_key(format!("{}:{}:{}", RISK_GATE_BLOCK, snapshot.symbol, code)),
                )
                .await;
            return Ok(CycleOutcome::RiskRejected(verdict));
        }

        c.exchange.set_leverage(&snapshot.symbol, leverage).await?;

        let report = c
            .ladder
            .execute(&OrderRequest {
                symbol: snapshot.symbol.clone(),
                side,
                qty,
                client_id_base: snapshot.cycle_id.clone(),
                slippage_cap_bps: None,
                guard: None,
                reduce_only: false,
                volatility: snapshot.volatility,
                liquidity_score: snapshot.liquidity_score,
            })
            .await;

        if report.left_resting() {
            self.mark_resting(snapshot, &report).await?;
        }
        if report.filled_qty <= 0.0 {
            if report.success {
                return Ok(CycleOutcome::OrderResting {
                    order_ids: report.order_ids,
                });
            }
            warn!(
                symbol = %snapshot.symbol,
                reason = report.abort_reason.as_ref().map(AbortReason::code).unwrap_or("-"),
                "ladder filled nothing"
            );
            return Ok(CycleOutcome::ExecutionFailed(report));
        }

        let entry = report.avg_price.unwrap_or(price);
        let new_trade = NewTrade {
            symbol: snapshot.symbol.clone(),
            side,
            qty: report.filled_qty,
            entry_price: entry,
            leverage,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            fees: report.filled_qty * entry * snapshot.risk.fee_rate,
            provenance: Provenance::Cycle,
            exchange_order_id: report.order_ids.last().cloned(),
            cycle_id: Some(snapshot.cycle_id.clone()),
            opened_at: Utc::now(),
        };
        let (trade, commands) = match Trade::open(new_trade) {
            Ok(transition) => transition,
            Err(e) => return Ok(self.open_failed(snapshot, e.to_string()).await),
        };
        match c.effects.apply(trade, commands).await {
            Ok(Some(applied)) => {
                info!(
                    symbol = %snapshot.symbol,
                    cycle_id = %snapshot.cycle_id,
                    trade_id = %applied.trade.id,
                    qty = applied.trade.qty,
                    entry = applied.trade.entry_price,
                    mode = ?report.order_mode,
                    "trade opened"
                );
                Ok(CycleOutcome::Opened(applied.trade))
            }
            Ok(None) => Ok(self
                .open_failed(snapshot, "an OPEN trade is already booked".to_string())
                .await),
            Err(e) => Ok(self.open_failed(snapshot, e.to_string()).await),
        }
    }

    /// Block opens on the symbol while an uncancelled order may still fill
    async fn mark_resting(&self, snapshot: &MarketSnapshot, report: &ExecutionReport) -> Result<(), CycleError> {
        let c = &self.components;
        let ttl = c.ladder.config().resting_order_ttl;
        let ids = report.order_ids.join(",");
        c.kv.set(&pending_order_key(&snapshot.symbol), &ids, Some(ttl)).await?;
        warn!(symbol = %snapshot.symbol, order_ids = %ids, ttl_secs = ttl.as_secs(), "order left resting, opens paused");
        self.alerts()
            .send(
                Alert::new(
                    AlertLevel::Warn,
                    ORDER_RESTING,
                    format!("{} order {} could not be cancelled and may still fill", snapshot.symbol, ids),
                )
                .with_context(json!({
                    "cycle_id": snapshot.cycle_id,
                    "filled_qty": report.filled_qty,
                }))
                .with_dedup_key(format!("{}:{}", ORDER_RESTING, snapshot.cycle_id)),
            )
            .await;
        Ok(())
    }

    async fn open_failed(&self, snapshot: &MarketSnapshot, reason: String) -> CycleOutcome {
        error!(symbol = %snapshot.symbol, cycle_id = %snapshot.cycle_id, reason = %reason, "fill not booked");
        self.alerts()
            .send(
                Alert::new(
                    AlertLevel::Error,
                    TRADE_OPEN_FAILED,
                    format!("Fill on {} could not be booked: {}", snapshot.symbol, reason),
                )
                .with_context(json!({ "cycle_id": snapshot.cycle_id }))
                .with_dedup_key(format!("{}:{}", TRADE_OPEN_FAILED, snapshot.cycle_id)),
            )
            .await;
        CycleOutcome::OpenFailed { reason }
    }

    async fn manage(&self, snapshot: &MarketSnapshot, trade: Trade) -> Result<CycleOutcome, CycleError> {
        let c = &self.components;
        let run = c.engine.run(&c.providers, snapshot, true).await;
        self.record(&run).await?;
        let result = &run.result;

        let action = match result.action {
            Action::Close => self.close(snapshot, &trade).await?,
            a if Side::from_action(a) == Some(trade.side)
                && (result.stop_loss.is_some() || result.take_profit.is_some()) =>
            {
                self.amend(&trade, result).await?
            }
            other => ManageAction::Hold {
                reason: if result.is_vetoed() {
                    result.reason()
                } else {
                    format!("consensus {}", other)
                },
            },
        };
        Ok(CycleOutcome::Managed(action))
    }

    async fn amend(&self, trade: &Trade, result: &ConsensusResult) -> Result<ManageAction, CycleError> {
        let (next, commands) = match trade.amend_stops(result.stop_loss, result.take_profit) {
            Ok(transition) => transition,
            Err(TradeTransitionError::Validation(e)) => {
                warn!(trade_id = %trade.id, error = %e, "proposed levels rejected");
                return Ok(ManageAction::Hold {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if commands.is_empty() {
            return Ok(ManageAction::Hold {
                reason: "levels unchanged".to_string(),
            });
        }
        match self.components.effects.apply(next, commands).await? {
            Some(applied) => Ok(ManageAction::Amended(applied.trade)),
            None => Ok(ManageAction::Hold {
                reason: "trade no longer open".to_string(),
            }),
        }
    }

    async fn close(&self, snapshot: &MarketSnapshot, trade: &Trade) -> Result<ManageAction, CycleError> {
        let c = &self.components;
        let commands = trade.request_close()?;
        let Some(applied) = c.effects.apply(trade.clone(), commands).await? else {
            return Ok(ManageAction::Hold {
                reason: "trade no longer open".to_string(),
            });
        };

        let ack = match (applied.close_ack, applied.close_error) {
            (Some(ack), _) if ack.filled_qty > 0.0 => ack,
            (_, error) => {
                let (code, message) = match error {
                    Some(e) => (e.code().to_string(), e.to_string()),
                    None => ("NOT_FILLED".to_string(), "reduce-only close did not fill".to_string()),
                };
                self.alerts()
                    .send(
                        Alert::new(
                            AlertLevel::Error,
                            TRADE_CLOSE_FAILED,
                            format!("Close of {} failed: {}", trade.symbol, message),
                        )
                        .with_context(json!({ "trade_id": trade.id, "code": code }))
                        .with_dedup_key(format!("{}:{}", TRADE_CLOSE_FAILED, trade.id)),
                    )
                    .await;
                return Ok(ManageAction::CloseFailed { code, message });
            }
        };

        if let Some(oco_id) = &trade.protection_order_id {
            if let Err(e) = c.exchange.cancel_oco_order(&trade.symbol, oco_id).await {
                warn!(trade_id = %trade.id, oco_id = %oco_id, error = %e, "failed to cancel protection after close");
            }
        }

        let exit = ack.avg_price.unwrap_or(snapshot.price);
        let fee = ack.filled_qty * exit * snapshot.risk.fee_rate;
        let (closed, commands) = trade.close(exit, fee, CloseReason::ConsensusClose, Utc::now())?;
        match c.effects.apply(closed.clone(), commands).await {
            Ok(Some(applied)) => Ok(ManageAction::Closed(applied.trade)),
            Ok(None) => Ok(ManageAction::Closed(closed)),
            // reconciliation closed it between our close order and this write
            Err(StoreError::NotOpen(_)) => Ok(ManageAction::Closed(closed)),
            Err(e) => Err(e.into()),
        }
    }
}

fn pending_order_key(symbol: &str) -> String {
    format!("{}:{}", PENDING_ORDER_NAMESPACE, symbol)
}

/// Consensus stop and take, when both are present and on the right side of `price`
fn consensus_levels(result: &ConsensusResult, side: Side, price: f64) -> Option<(f64, f64)> {
    let (sl, tp) = (result.stop_loss?, result.take_profit?);
    validate_levels(side, price, Some(sl), Some(tp)).ok()?;
    Some((sl, tp))
}
