//! Trading cycle end-to-end tests
//!
//! Full cycles against the paper venue with the SQLite trade book and audit
//! trail: open, execution fallback, manage-path close and re-entry.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use consensus_trader::application::cycle_runner::{CycleOutcome, CycleRunner, ManageAction};
use consensus_trader::domain::entities::decision::{Action, ProviderDecision, Stage};
use consensus_trader::domain::entities::market::{Kline, MarketSnapshot, RiskParams, Side};
use consensus_trader::domain::entities::trade::{CloseReason, TradeStatus};
use consensus_trader::domain::errors::ProviderError;
use consensus_trader::domain::policy::SafetyPolicy;
use consensus_trader::domain::repositories::ai_provider::AiProvider;
use consensus_trader::domain::repositories::alert_dispatcher::RecordingAlertDispatcher;
use consensus_trader::domain::repositories::kv_store::{InMemoryKvStore, KvStore};
use consensus_trader::domain::repositories::trade_store::TradeStore;
use consensus_trader::infrastructure::market_data::ExchangeMarketData;
use consensus_trader::infrastructure::paper_exchange::{PaperExchange, PaperExchangeConfig};
use consensus_trader::persistence::init_database;
use consensus_trader::persistence::repository::{DecisionAuditRepository, SqliteTradeStore};

struct Scripted {
    name: String,
    action: Action,
    confidence: i64,
    levels: Option<(f64, f64, u32)>,
}

#[async_trait]
impl AiProvider for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(
        &self,
        _snapshot: &MarketSnapshot,
        stage: Stage,
        _symbol: &str,
    ) -> Result<ProviderDecision, ProviderError> {
        let decision = ProviderDecision::new(&self.name, stage, self.action, self.confidence)
            .map_err(|e| ProviderError::Malformed {
                provider: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(match self.levels {
            Some((sl, tp, lev)) => decision
                .with_stops(Some(sl), Some(tp))
                .map_err(|e| ProviderError::Malformed {
                    provider: self.name.clone(),
                    reason: e.to_string(),
                })?
                .with_leverage(Some(lev)),
            None => decision,
        })
    }
}

fn long_provider(name: &str, confidence: i64) -> Arc<dyn AiProvider> {
    Arc::new(Scripted {
        name: name.to_string(),
        action: Action::Long,
        confidence,
        levels: Some((46_000.0, 58_000.0, 15)),
    })
}

fn plain(name: &str, action: Action) -> Arc<dyn AiProvider> {
    Arc::new(Scripted {
        name: name.to_string(),
        action,
        confidence: 80,
        levels: None,
    })
}

fn bars() -> Vec<Kline> {
    let t0 = Utc::now() - ChronoDuration::minutes(100);
    (0..40)
        .map(|i| {
            let close = 49_000.0 + 25.0 * i as f64;
            Kline {
                open_time: t0 + ChronoDuration::minutes(i),
                open: close,
                high: close * 1.002,
                low: close * 0.998,
                close,
                volume: 1.0,
            }
        })
        .collect()
}

struct Harness {
    exchange: Arc<PaperExchange>,
    store: Arc<SqliteTradeStore>,
    audit: Arc<DecisionAuditRepository>,
    alerts: Arc<RecordingAlertDispatcher>,
    kv: Arc<dyn KvStore>,
}

impl Harness {
    async fn new(config: PaperExchangeConfig) -> Self {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let exchange = Arc::new(PaperExchange::with_config(config));
        exchange.set_price("BTCUSDT", 50_000.0).await;
        exchange.set_klines("BTCUSDT", bars()).await;
        Self {
            exchange,
            store: Arc::new(SqliteTradeStore::new(pool.clone())),
            audit: Arc::new(DecisionAuditRepository::new(pool)),
            alerts: Arc::new(RecordingAlertDispatcher::new()),
            kv: Arc::new(InMemoryKvStore::new()),
        }
    }

    fn runner(&self, providers: Vec<Arc<dyn AiProvider>>) -> CycleRunner {
        let market_data = Arc::new(ExchangeMarketData::new(
            self.exchange.clone(),
            self.store.clone(),
            RiskParams {
                leverage: 5,
                risk_per_trade: 0.01,
                fee_rate: 0.0006,
                slippage_rate: 0.0005,
            },
            "5",
        ));
        CycleRunner::from_policy(
            &SafetyPolicy::default(),
            providers,
            market_data,
            self.exchange.clone(),
            self.kv.clone(),
            self.store.clone(),
            self.audit.clone(),
            self.alerts.clone(),
        )
    }
}

#[tokio::test]
async fn test_cycle_opens_and_persists_to_sqlite() {
    let h = Harness::new(PaperExchangeConfig::default()).await;
    let runner = h.runner(vec![long_provider("alpha", 80), long_provider("beta", 84)]);

    let outcome = runner.run_symbol("BTCUSDT").await.unwrap();
    let CycleOutcome::Opened(trade) = outcome else {
        panic!("expected an open, got {:?}", outcome);
    };

    let stored = h.store.get(&trade.id).await.unwrap().unwrap();
    assert_eq!(stored.id, trade.id);
    assert_eq!(stored.qty, trade.qty);
    assert_eq!(stored.stop_loss, Some(46_000.0));
    assert_eq!(stored.status, TradeStatus::Open);
    assert_eq!(stored.side, Side::Long);
    assert!(stored.protection_order_id.is_some());

    let cycle_id = trade.cycle_id.clone().unwrap();
    let rows = h.audit.for_cycle(&cycle_id).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].stage, Stage::Final);
    assert_eq!(rows[2].action, Some(Action::Long));

    let orders = h.exchange.orders().await;
    assert_eq!(orders[0].client_order_id, format!("{}-po", cycle_id));
    assert_eq!(h.alerts.codes().await, vec!["TRADE_OPENED"]);
}

#[tokio::test]
async fn test_rejected_post_only_falls_back_to_ioc() {
    let h = Harness::new(PaperExchangeConfig {
        reject_post_only: true,
        ..PaperExchangeConfig::default()
    })
    .await;
    let runner = h.runner(vec![long_provider("alpha", 80)]);

    let CycleOutcome::Opened(trade) = runner.run_symbol("BTCUSDT").await.unwrap() else {
        panic!("expected an open through the IOC rung");
    };
    let cycle_id = trade.cycle_id.unwrap();
    let ids: Vec<String> = h
        .exchange
        .orders()
        .await
        .into_iter()
        .map(|o| o.client_order_id)
        .collect();
    assert_eq!(ids[0], format!("{}-po", cycle_id));
    assert_eq!(ids[1], format!("{}-ioc", cycle_id));
    assert_eq!(h.store.open_trades().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hold_consensus_books_nothing() {
    let h = Harness::new(PaperExchangeConfig::default()).await;
    let runner = h.runner(vec![plain("alpha", Action::Hold), plain("beta", Action::Hold)]);

    let outcome = runner.run_symbol("BTCUSDT").await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::NoAction {
            action: Action::Hold,
            veto: None
        }
    ));
    assert!(h.exchange.orders().await.is_empty());
    assert!(h.store.open_trades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_close_then_reenter() {
    let h = Harness::new(PaperExchangeConfig::default()).await;
    let opener = h.runner(vec![long_provider("alpha", 80)]);
    let CycleOutcome::Opened(first) = opener.run_symbol("BTCUSDT").await.unwrap() else {
        panic!("expected an open");
    };

    h.exchange.set_price("BTCUSDT", 51_000.0).await;
    let closer = h.runner(vec![plain("alpha", Action::Close)]);
    let outcome = closer.run_symbol("BTCUSDT").await.unwrap();
    let CycleOutcome::Managed(ManageAction::Closed(closed)) = outcome else {
        panic!("expected a close, got {:?}", outcome);
    };
    assert_eq!(closed.id, first.id);
    assert_eq!(closed.close_reason, Some(CloseReason::ConsensusClose));
    assert!(closed.realized_pnl.unwrap() > 0.0);

    let history = h.store.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TradeStatus::Closed);

    // a closed trade frees the (symbol, provenance) slot
    let CycleOutcome::Opened(second) = opener.run_symbol("BTCUSDT").await.unwrap() else {
        panic!("expected a second open");
    };
    assert_ne!(second.id, first.id);
    assert_eq!(h.store.open_trades().await.unwrap().len(), 1);
    assert_eq!(
        h.store.get(&first.id).await.unwrap().unwrap().status,
        TradeStatus::Closed
    );
}
