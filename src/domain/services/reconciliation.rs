//! Reconciliation Service
//!
//! Brings the local book back in line with what the exchange reports.
//! Orphan positions (on the exchange, not in the book) are adopted with
//! protective orders. OPEN trades whose position disappeared are closed from
//! the closing fill. Both passes only write through conditional store
//! operations, so they are safe to run concurrently with live cycles and to
//! repeat on an unchanged exchange.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::entities::market::Side;
use crate::domain::entities::trade::{CloseReason, Trade, TradeCommand};
use crate::domain::errors::{ReconciliationError, StoreError};
use crate::domain::policy::ReconciliationPolicy;
use crate::domain::repositories::alert_dispatcher::{Alert, AlertDispatcher, AlertLevel};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangePosition, Execution};
use crate::domain::repositories::trade_store::TradeStore;
use crate::domain::services::lease_lock::LeaseLock;
use crate::domain::services::trade_effects::TradeEffects;

pub const RECONCILIATION_ORPHAN: &str = "RECONCILIATION_ORPHAN";
pub const EXTERNAL_CLOSE: &str = "EXTERNAL_CLOSE";
pub const EXTERNAL_CLOSE_UNRESOLVED: &str = "EXTERNAL_CLOSE_UNRESOLVED";

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub adopted: Vec<String>,
    pub matched: usize,
    /// Orphans left for the next pass (busy lease, duplicate, bad data)
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExternalCloseReport {
    pub closed: Vec<String>,
    pub still_open: usize,
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub external_closes: ExternalCloseReport,
    pub orphans: OrphanReport,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

pub struct ReconciliationService {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    alerts: Arc<dyn AlertDispatcher>,
    effects: TradeEffects,
    policy: ReconciliationPolicy,
    cycle_lock: Option<LeaseLock>,
}

fn exchange_err(step: &str, e: impl std::fmt::Display) -> ReconciliationError {
    ReconciliationError::Exchange {
        step: step.to_string(),
        message: e.to_string(),
    }
}

fn matches_position(trade: &Trade, position: &ExchangePosition) -> bool {
    trade.symbol == position.symbol && position.side() == Some(trade.side)
}

impl ReconciliationService {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        alerts: Arc<dyn AlertDispatcher>,
        policy: ReconciliationPolicy,
    ) -> Self {
        let effects = TradeEffects::new(exchange.clone(), store.clone(), alerts.clone());
        Self {
            exchange,
            store,
            alerts,
            effects,
            policy,
            cycle_lock: None,
        }
    }

    /// Skip adopting a symbol while a cycle holds its lease; the cycle
    /// books its own fill. Once the lease is free the book is read again,
    /// since the cycle may have booked and released after the snapshot.
    pub fn with_cycle_lock(mut self, lock: LeaseLock) -> Self {
        self.cycle_lock = Some(lock);
        self
    }

    async fn live_positions(&self) -> Result<Vec<ExchangePosition>, ReconciliationError> {
        let positions = self
            .exchange
            .positions()
            .await
            .map_err(|e| exchange_err("positions", e))?;
        Ok(positions.into_iter().filter(|p| p.size != 0.0).collect())
    }

    pub async fn reconcile_orphan_positions(&self) -> Result<OrphanReport, ReconciliationError> {
        let positions = self.live_positions().await?;
        let open = self.store.open_trades().await?;
        let mut report = OrphanReport::default();

        for position in positions {
            if open.iter().any(|t| matches_position(t, &position)) {
                report.matched += 1;
                continue;
            }
            let Some(side) = position.side() else { continue };

            if let Some(lock) = &self.cycle_lock {
                match lock.is_held(&position.symbol).await {
                    Ok(false) => {}
                    Ok(true) => {
                        debug!(symbol = %position.symbol, "cycle in flight, deferring orphan");
                        report.skipped.push(position.symbol.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(symbol = %position.symbol, error = %e, "lease check failed, deferring orphan");
                        report.skipped.push(position.symbol.clone());
                        continue;
                    }
                }
            }

            let current = self.store.open_trades_for_symbol(&position.symbol).await?;
            if current.iter().any(|t| matches_position(t, &position)) {
                debug!(symbol = %position.symbol, "booked since snapshot, not an orphan");
                report.matched += 1;
                continue;
            }

            match self.adopt(&position, side).await? {
                Some(trade_id) => report.adopted.push(trade_id),
                None => report.skipped.push(position.symbol.clone()),
            }
        }

        if !report.adopted.is_empty() {
            info!(adopted = report.adopted.len(), matched = report.matched, "orphan positions adopted");
        }
        Ok(report)
    }

    async fn adopt(&self, position: &ExchangePosition, side: Side) -> Result<Option<String>, ReconciliationError> {
        let transition = Trade::adopt_orphan(
            &position.symbol,
            side,
            position.size.abs(),
            position.avg_price,
            self.policy.orphan_take_profit_pct,
            self.policy.orphan_stop_loss_pct,
            Utc::now(),
        );
        let (trade, commands) = match transition {
            Ok(t) => t,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "cannot adopt orphan position");
                return Ok(None);
            }
        };
        let mut trade = trade;
        if let Some(leverage) = position.leverage {
            trade.leverage = leverage.max(1);
        }
        let commands = commands
            .into_iter()
            .map(|c| match c {
                TradeCommand::Persist(_) => TradeCommand::Persist(trade.clone()),
                other => other,
            })
            .collect();

        match self.effects.apply(trade, commands).await? {
            Some(applied) => {
                warn!(
                    symbol = %position.symbol,
                    side = %side,
                    qty = position.size.abs(),
                    trade_id = %applied.trade.id,
                    code = RECONCILIATION_ORPHAN,
                    "adopted orphan position"
                );
                Ok(Some(applied.trade.id))
            }
            None => Ok(None),
        }
    }

    /// First opposite-side fill at or after the trade opened
    fn closing_fill<'a>(trade: &Trade, fills: &'a [Execution]) -> Option<&'a Execution> {
        let exit_side = trade.side.exit_order_side();
        let mut candidates: Vec<&Execution> = fills
            .iter()
            .filter(|f| f.side == exit_side && f.executed_at >= trade.opened_at && f.price > 0.0)
            .collect();
        candidates.sort_by_key(|f| f.executed_at);
        candidates.into_iter().next()
    }

    pub async fn reconcile_external_closes(&self) -> Result<ExternalCloseReport, ReconciliationError> {
        let positions = self.live_positions().await?;
        let open = self.store.open_trades().await?;
        let since = Utc::now()
            - chrono::Duration::from_std(self.policy.execution_lookback)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut report = ExternalCloseReport::default();

        for trade in open {
            if positions.iter().any(|p| matches_position(&trade, p)) {
                report.still_open += 1;
                continue;
            }

            let fills = match self.exchange.executions(&trade.symbol, since).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(symbol = %trade.symbol, trade_id = %trade.id, error = %e, "execution lookup failed");
                    self.report_unresolved(&trade, &format!("execution lookup failed: {}", e)).await;
                    report.unresolved.push(trade.id.clone());
                    continue;
                }
            };

            let Some(fill) = Self::closing_fill(&trade, &fills) else {
                self.report_unresolved(&trade, "no closing execution found").await;
                report.unresolved.push(trade.id.clone());
                continue;
            };

            if self.close_from_fill(&trade, fill).await? {
                report.closed.push(trade.id.clone());
            }
        }

        if !report.closed.is_empty() || !report.unresolved.is_empty() {
            info!(
                closed = report.closed.len(),
                unresolved = report.unresolved.len(),
                still_open = report.still_open,
                "external closes reconciled"
            );
        }
        Ok(report)
    }

    async fn close_from_fill(&self, trade: &Trade, fill: &Execution) -> Result<bool, ReconciliationError> {
        let (closed, commands) = match trade.close(fill.price, fill.fee, CloseReason::ExternalReconciliation, fill.executed_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "cannot close trade from fill");
                return Ok(false);
            }
        };
        let pnl = closed.realized_pnl.unwrap_or(0.0);
        let commands = commands
            .into_iter()
            .map(|c| match c {
                TradeCommand::Notify { .. } => TradeCommand::Notify {
                    level: AlertLevel::Warn,
                    code: EXTERNAL_CLOSE.to_string(),
                    message: format!(
                        "{} {} closed outside the system @ {} pnl={:.4}",
                        trade.side, trade.symbol, fill.price, pnl
                    ),
                },
                other => other,
            })
            .collect();

        match self.effects.apply(closed, commands).await {
            Ok(_) => {
                info!(symbol = %trade.symbol, trade_id = %trade.id, exit = fill.price, pnl, code = EXTERNAL_CLOSE, "trade closed externally");
                Ok(true)
            }
            // a concurrent writer got there first
            Err(StoreError::NotOpen(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn report_unresolved(&self, trade: &Trade, detail: &str) {
        warn!(symbol = %trade.symbol, trade_id = %trade.id, detail, code = EXTERNAL_CLOSE_UNRESOLVED, "external close unresolved");
        self.alerts
            .send(
                Alert::new(
                    AlertLevel::Warn,
                    EXTERNAL_CLOSE_UNRESOLVED,
                    format!("{} {} has no exchange position: {}", trade.side, trade.symbol, detail),
                )
                .with_context(json!({ "trade_id": trade.id, "symbol": trade.symbol }))
                .with_dedup_key(format!("{}:{}", EXTERNAL_CLOSE_UNRESOLVED, trade.id)),
            )
            .await;
    }

    /// External closes first, so a flipped position is closed before the
    /// new side is adopted.
    pub async fn run_pass(&self) -> Result<ReconciliationSummary, ReconciliationError> {
        let started = Instant::now();
        let external_closes = self.reconcile_external_closes().await?;
        let orphans = self.reconcile_orphan_positions().await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(duration_ms, "reconciliation pass finished");
        Ok(ReconciliationSummary {
            external_closes,
            orphans,
            duration_ms,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::OrderSide;
    use crate::domain::entities::trade::{NewTrade, Provenance, TradeStatus};
    use crate::domain::repositories::alert_dispatcher::RecordingAlertDispatcher;
    use crate::domain::repositories::kv_store::InMemoryKvStore;
    use crate::domain::repositories::trade_store::InMemoryTradeStore;
    use crate::domain::services::lease_lock::Lease;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::Mutex;

    /// Store whose first `open_trades` read is followed by a cycle booking
    /// its fill and releasing the lease, before the caller acts on the read.
    struct LateBookingStore {
        inner: Arc<InMemoryTradeStore>,
        lock: LeaseLock,
        pending: Mutex<Option<(Trade, Lease)>>,
    }

    #[async_trait]
    impl TradeStore for LateBookingStore {
        async fn insert_open(&self, trade: &Trade) -> Result<bool, StoreError> {
            self.inner.insert_open(trade).await
        }

        async fn update_open(&self, trade: &Trade) -> Result<(), StoreError> {
            self.inner.update_open(trade).await
        }

        async fn get(&self, id: &str) -> Result<Option<Trade>, StoreError> {
            self.inner.get(id).await
        }

        async fn open_trades(&self) -> Result<Vec<Trade>, StoreError> {
            let snapshot = self.inner.open_trades().await?;
            if let Some((trade, lease)) = self.pending.lock().await.take() {
                assert!(self.inner.insert_open(&trade).await?);
                assert!(self.lock.release(&lease).await.unwrap());
            }
            Ok(snapshot)
        }

        async fn open_trades_for_symbol(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
            self.inner.open_trades_for_symbol(symbol).await
        }
    }

    struct Fixture {
        service: ReconciliationService,
        exchange: Arc<PaperExchange>,
        store: Arc<InMemoryTradeStore>,
        alerts: Arc<RecordingAlertDispatcher>,
    }

    fn fixture() -> Fixture {
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryTradeStore::new());
        let alerts = Arc::new(RecordingAlertDispatcher::new());
        let service = ReconciliationService::new(
            exchange.clone(),
            store.clone(),
            alerts.clone(),
            ReconciliationPolicy::default(),
        );
        Fixture {
            service,
            exchange,
            store,
            alerts,
        }
    }

    fn position(symbol: &str, size: f64, avg: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            size,
            avg_price: avg,
            leverage: Some(5),
        }
    }

    async fn book_long(store: &InMemoryTradeStore, symbol: &str, opened_at: DateTime<Utc>) -> Trade {
        let trade = cycle_long(symbol, opened_at);
        store.insert_open(&trade).await.unwrap();
        trade
    }

    fn cycle_long(symbol: &str, opened_at: DateTime<Utc>) -> Trade {
        let (trade, _) = Trade::open(NewTrade {
            symbol: symbol.to_string(),
            side: Side::Long,
            qty: 1.0,
            entry_price: 100.0,
            leverage: 5,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            fees: 0.1,
            provenance: Provenance::Cycle,
            exchange_order_id: None,
            cycle_id: None,
            opened_at,
        })
        .unwrap();
        trade
    }

    #[tokio::test]
    async fn test_orphan_adopted_once() {
        let f = fixture();
        f.exchange.set_positions(vec![position("ETHUSDT", -2.0, 2_000.0)]).await;

        let first = f.service.reconcile_orphan_positions().await.unwrap();
        assert_eq!(first.adopted.len(), 1);
        let second = f.service.reconcile_orphan_positions().await.unwrap();
        assert!(second.adopted.is_empty());
        assert_eq!(second.matched, 1);

        let trades = f.store.all().await;
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.provenance, Provenance::ReconciliationOrphan);
        assert_eq!(t.side, Side::Short);
        assert_eq!(t.leverage, 5);
        assert!((t.take_profit.unwrap() - 1_960.0).abs() < 1e-9);
        assert!((t.stop_loss.unwrap() - 2_020.0).abs() < 1e-9);
        assert!(t.protection_order_id.is_some());
        assert_eq!(f.exchange.oco_orders().await.len(), 1);
        assert!(f.alerts.codes().await.contains(&RECONCILIATION_ORPHAN.to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_passes_do_not_double_book() {
        let f = fixture();
        f.exchange.set_positions(vec![position("BTCUSDT", 0.5, 50_000.0)]).await;
        let service = Arc::new(f.service);
        let a = {
            let s = service.clone();
            tokio::spawn(async move { s.reconcile_orphan_positions().await.unwrap() })
        };
        let b = {
            let s = service.clone();
            tokio::spawn(async move { s.reconcile_orphan_positions().await.unwrap() })
        };
        let adopted = a.await.unwrap().adopted.len() + b.await.unwrap().adopted.len();
        assert_eq!(adopted, 1);
        assert_eq!(f.store.open_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_deferred_while_cycle_holds_lease() {
        let f = fixture();
        let lock = LeaseLock::for_cycles(Arc::new(InMemoryKvStore::new()));
        let _lease = lock.try_acquire("BTCUSDT").await.unwrap().unwrap();
        let service = f.service.with_cycle_lock(lock);
        f.exchange.set_positions(vec![position("BTCUSDT", 0.5, 50_000.0)]).await;

        let report = service.reconcile_orphan_positions().await.unwrap();
        assert!(report.adopted.is_empty());
        assert_eq!(report.skipped, vec!["BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn test_fill_booked_after_snapshot_is_not_adopted() {
        let exchange = Arc::new(PaperExchange::new());
        let inner = Arc::new(InMemoryTradeStore::new());
        let lock = LeaseLock::for_cycles(Arc::new(InMemoryKvStore::new()));
        let lease = lock.try_acquire("BTCUSDT").await.unwrap().unwrap();
        let store = Arc::new(LateBookingStore {
            inner: inner.clone(),
            lock: lock.clone(),
            pending: Mutex::new(Some((cycle_long("BTCUSDT", Utc::now()), lease))),
        });
        let service = ReconciliationService::new(
            exchange.clone(),
            store,
            Arc::new(RecordingAlertDispatcher::new()),
            ReconciliationPolicy::default(),
        )
        .with_cycle_lock(lock);
        exchange.set_positions(vec![position("BTCUSDT", 1.0, 100.0)]).await;

        let report = service.reconcile_orphan_positions().await.unwrap();
        assert!(report.adopted.is_empty());
        assert_eq!(report.matched, 1);

        let open = inner.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].provenance, Provenance::Cycle);
        assert!(exchange.oco_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_external_close_uses_first_opposite_fill() {
        let f = fixture();
        let opened = Utc::now() - ChronoDuration::hours(1);
        let trade = book_long(&f.store, "SOLUSDT", opened).await;

        f.exchange
            .add_execution(Execution {
                symbol: "SOLUSDT".to_string(),
                side: OrderSide::Sell,
                qty: 1.0,
                price: 90.0,
                fee: 0.0,
                order_id: "before-open".to_string(),
                executed_at: opened - ChronoDuration::minutes(5),
            })
            .await;
        f.exchange
            .add_execution(Execution {
                symbol: "SOLUSDT".to_string(),
                side: OrderSide::Sell,
                qty: 1.0,
                price: 108.0,
                fee: 0.2,
                order_id: "close".to_string(),
                executed_at: opened + ChronoDuration::minutes(30),
            })
            .await;

        let report = f.service.reconcile_external_closes().await.unwrap();
        assert_eq!(report.closed, vec![trade.id.clone()]);

        let closed = f.store.get(&trade.id).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::ExternalReconciliation));
        assert_eq!(closed.exit_price, Some(108.0));
        // (108 - 100) * 1 - (0.1 + 0.2)
        assert!((closed.realized_pnl.unwrap() - 7.7).abs() < 1e-9);
        assert!(f.alerts.codes().await.contains(&EXTERNAL_CLOSE.to_string()));

        let again = f.service.reconcile_external_closes().await.unwrap();
        assert!(again.closed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fill_is_unresolved_and_retried() {
        let f = fixture();
        let trade = book_long(&f.store, "SOLUSDT", Utc::now() - ChronoDuration::minutes(10)).await;

        let report = f.service.reconcile_external_closes().await.unwrap();
        assert_eq!(report.unresolved, vec![trade.id.clone()]);
        assert!(f.store.get(&trade.id).await.unwrap().unwrap().is_open());
        assert!(f.alerts.codes().await.contains(&EXTERNAL_CLOSE_UNRESOLVED.to_string()));
    }

    #[tokio::test]
    async fn test_matched_trade_is_left_alone() {
        let f = fixture();
        book_long(&f.store, "BTCUSDT", Utc::now()).await;
        f.exchange.set_positions(vec![position("BTCUSDT", 1.0, 100.0)]).await;

        let summary = f.service.run_pass().await.unwrap();
        assert_eq!(summary.external_closes.still_open, 1);
        assert_eq!(summary.orphans.matched, 1);
        assert!(summary.orphans.adopted.is_empty());
    }

    #[tokio::test]
    async fn test_positions_failure_is_an_error() {
        let f = fixture();
        f.exchange.fail_positions(true).await;
        assert!(matches!(
            f.service.run_pass().await,
            Err(ReconciliationError::Exchange { .. })
        ));
    }
}
