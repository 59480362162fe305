//! Applies the side effects requested by `Trade` transitions.
//!
//! Transitions are pure; this is where their commands meet the trade store,
//! the exchange and the alert dispatcher. A duplicate OPEN insert stops the
//! batch so a racing writer never gets protection orders attached twice.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::entities::trade::{Trade, TradeCommand};
use crate::domain::errors::StoreError;
use crate::domain::repositories::alert_dispatcher::{Alert, AlertDispatcher, AlertLevel};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, OcoParams, OrderAck,
};
use crate::domain::repositories::trade_store::TradeStore;

#[derive(Debug, Clone)]
pub struct AppliedEffects {
    /// Latest persisted snapshot
    pub trade: Trade,
    pub inserted: bool,
    pub close_ack: Option<OrderAck>,
    pub close_error: Option<ExchangeError>,
    pub protection_error: Option<ExchangeError>,
}

#[derive(Clone)]
pub struct TradeEffects {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn TradeStore>,
    alerts: Arc<dyn AlertDispatcher>,
}

impl TradeEffects {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            exchange,
            store,
            alerts,
        }
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<dyn AlertDispatcher> {
        &self.alerts
    }

    /// Apply `commands` in order. `Ok(None)` means the trade was a duplicate
    /// OPEN insert and nothing else ran.
    pub async fn apply(
        &self,
        trade: Trade,
        commands: Vec<TradeCommand>,
    ) -> Result<Option<AppliedEffects>, StoreError> {
        let mut applied = AppliedEffects {
            trade,
            inserted: false,
            close_ack: None,
            close_error: None,
            protection_error: None,
        };

        for command in commands {
            match command {
                TradeCommand::Persist(next) => {
                    if self.store.get(&next.id).await?.is_none() {
                        if !self.store.insert_open(&next).await? {
                            debug!(symbol = %next.symbol, provenance = next.provenance.as_str(), "open trade already booked");
                            return Ok(None);
                        }
                        applied.inserted = true;
                    } else {
                        self.store.update_open(&next).await?;
                    }
                    applied.trade = next;
                }
                TradeCommand::AttachProtection {
                    trade_id,
                    symbol,
                    side,
                    qty,
                    stop_loss,
                    take_profit,
                } => {
                    let params = OcoParams {
                        symbol,
                        side: side.exit_order_side(),
                        qty,
                        take_profit,
                        stop_loss,
                        client_order_id: format!("{}-oco", trade_id),
                    };
                    self.attach(&mut applied, params).await?;
                }
                TradeCommand::ReplaceProtection {
                    trade_id,
                    symbol,
                    side,
                    qty,
                    previous_order_id,
                    stop_loss,
                    take_profit,
                } => {
                    if let Some(previous) = previous_order_id {
                        if let Err(e) = self.exchange.cancel_oco_order(&symbol, &previous).await {
                            warn!(symbol = %symbol, oco_id = %previous, error = %e, "failed to cancel previous protection");
                        }
                    }
                    let suffix = Uuid::new_v4().simple().to_string();
                    let params = OcoParams {
                        symbol,
                        side: side.exit_order_side(),
                        qty,
                        take_profit,
                        stop_loss,
                        client_order_id: format!("{}-oco-{}", trade_id, &suffix[..8]),
                    };
                    self.attach(&mut applied, params).await?;
                }
                TradeCommand::CloseOnExchange {
                    trade_id,
                    symbol,
                    side,
                    qty,
                } => {
                    let link_id = format!("{}-close", trade_id);
                    match self
                        .exchange
                        .close_reduce_only_market(&symbol, side.exit_order_side(), qty, &link_id)
                        .await
                    {
                        Ok(ack) => applied.close_ack = Some(ack),
                        Err(e) => {
                            warn!(symbol = %symbol, trade_id = %trade_id, error = %e, "reduce-only close failed");
                            applied.close_error = Some(e);
                        }
                    }
                }
                TradeCommand::Notify {
                    level,
                    code,
                    message,
                } => {
                    let alert = Alert::new(level, code.clone(), message)
                        .with_context(json!({
                            "trade_id": applied.trade.id,
                            "symbol": applied.trade.symbol,
                        }))
                        .with_dedup_key(format!("{}:{}", code, applied.trade.id));
                    self.alerts.send(alert).await;
                }
            }
        }
        Ok(Some(applied))
    }

    async fn attach(&self, applied: &mut AppliedEffects, params: OcoParams) -> Result<(), StoreError> {
        match self.exchange.create_oco_order(&params).await {
            Ok(ack) => {
                let (next, _) = applied.trade.with_protection_order(ack.oco_id);
                self.store.update_open(&next).await?;
                applied.trade = next;
            }
            Err(e) => {
                warn!(symbol = %params.symbol, error = %e, "failed to attach protection");
                self.alerts
                    .send(
                        Alert::new(
                            AlertLevel::Error,
                            "PROTECTION_ATTACH_FAILED",
                            format!("Could not attach stop/take for {}: {}", params.symbol, e),
                        )
                        .with_context(json!({ "trade_id": applied.trade.id, "code": e.code() }))
                        .with_dedup_key(format!("protection:{}", applied.trade.id)),
                    )
                    .await;
                applied.protection_error = Some(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::Side;
    use crate::domain::entities::trade::{NewTrade, Provenance};
    use crate::domain::repositories::alert_dispatcher::RecordingAlertDispatcher;
    use crate::domain::repositories::trade_store::InMemoryTradeStore;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use chrono::Utc;

    fn new_trade() -> NewTrade {
        NewTrade {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: 0.1,
            entry_price: 50_000.0,
            leverage: 5,
            stop_loss: Some(49_000.0),
            take_profit: Some(52_000.0),
            fees: 0.0,
            provenance: Provenance::Cycle,
            exchange_order_id: None,
            cycle_id: Some("c1".to_string()),
            opened_at: Utc::now(),
        }
    }

    fn effects() -> (TradeEffects, Arc<PaperExchange>, Arc<InMemoryTradeStore>, Arc<RecordingAlertDispatcher>) {
        let exchange = Arc::new(PaperExchange::new());
        let store = Arc::new(InMemoryTradeStore::new());
        let alerts = Arc::new(RecordingAlertDispatcher::new());
        (
            TradeEffects::new(exchange.clone(), store.clone(), alerts.clone()),
            exchange,
            store,
            alerts,
        )
    }

    #[tokio::test]
    async fn test_open_persists_and_attaches_protection() {
        let (effects, exchange, store, alerts) = effects();
        let (trade, commands) = Trade::open(new_trade()).unwrap();
        let applied = effects.apply(trade.clone(), commands).await.unwrap().unwrap();

        assert!(applied.inserted);
        assert!(applied.trade.protection_order_id.is_some());
        let stored = store.get(&trade.id).await.unwrap().unwrap();
        assert_eq!(stored.protection_order_id, applied.trade.protection_order_id);
        assert_eq!(exchange.oco_orders().await.len(), 1);
        assert_eq!(alerts.codes().await, vec!["TRADE_OPENED".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_open_stops_batch() {
        let (effects, exchange, _, alerts) = effects();
        let (first, commands) = Trade::open(new_trade()).unwrap();
        effects.apply(first, commands).await.unwrap();
        let (second, commands) = Trade::open(new_trade()).unwrap();
        assert!(effects.apply(second, commands).await.unwrap().is_none());
        assert_eq!(exchange.oco_orders().await.len(), 1);
        assert_eq!(alerts.codes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_amend_replaces_oco() {
        let (effects, exchange, _, _) = effects();
        let (trade, commands) = Trade::open(new_trade()).unwrap();
        let applied = effects.apply(trade, commands).await.unwrap().unwrap();
        let first_oco = applied.trade.protection_order_id.clone().unwrap();

        let (next, commands) = applied.trade.amend_stops(Some(49_500.0), None).unwrap();
        let applied = effects.apply(next, commands).await.unwrap().unwrap();
        assert_ne!(applied.trade.protection_order_id.as_deref(), Some(first_oco.as_str()));
        let ocos = exchange.oco_orders().await;
        assert_eq!(ocos.iter().filter(|o| o.active).count(), 1);
    }
}
