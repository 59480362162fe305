//! Database Models
//!
//! Row shapes for the `trades` and `decision_audit` tables, and their
//! conversion to domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::audit::DecisionAuditRecord;
use crate::domain::entities::decision::{normalize_action, Stage};
use crate::domain::entities::market::Side;
use crate::domain::entities::trade::{Trade, TradeStatus};
use crate::domain::errors::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: i64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: String,
    pub provenance: String,
    pub realized_pnl: Option<f64>,
    pub fees: f64,
    pub exit_price: Option<f64>,
    pub close_reason: Option<String>,
    pub exchange_order_id: Option<String>,
    pub protection_order_id: Option<String>,
    pub cycle_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<&Trade> for TradeRecord {
    fn from(t: &Trade) -> Self {
        Self {
            id: t.id.clone(),
            symbol: t.symbol.clone(),
            side: t.side.as_str().to_string(),
            qty: t.qty,
            entry_price: t.entry_price,
            leverage: i64::from(t.leverage),
            stop_loss: t.stop_loss,
            take_profit: t.take_profit,
            status: t.status.as_str().to_string(),
            provenance: t.provenance.as_str().to_string(),
            realized_pnl: t.realized_pnl,
            fees: t.fees,
            exit_price: t.exit_price,
            close_reason: t.close_reason.map(|r| r.as_str().to_string()),
            exchange_order_id: t.exchange_order_id.clone(),
            protection_order_id: t.protection_order_id.clone(),
            cycle_id: t.cycle_id.clone(),
            opened_at: t.opened_at,
            closed_at: t.closed_at,
        }
    }
}

impl TryFrom<TradeRecord> for Trade {
    type Error = StoreError;

    fn try_from(r: TradeRecord) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: r.id.clone(),
            reason,
        };
        let side = match r.side.as_str() {
            "LONG" => Side::Long,
            "SHORT" => Side::Short,
            other => return Err(corrupt(format!("side {}", other))),
        };
        let status: TradeStatus = r.status.parse().map_err(corrupt)?;
        let provenance = r.provenance.parse().map_err(corrupt)?;
        let close_reason = r
            .close_reason
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(corrupt)?;
        let leverage = u32::try_from(r.leverage).map_err(|_| corrupt(format!("leverage {}", r.leverage)))?;

        Ok(Trade {
            id: r.id,
            symbol: r.symbol,
            side,
            qty: r.qty,
            entry_price: r.entry_price,
            leverage,
            stop_loss: r.stop_loss,
            take_profit: r.take_profit,
            status,
            realized_pnl: r.realized_pnl,
            fees: r.fees,
            opened_at: r.opened_at,
            closed_at: r.closed_at,
            provenance,
            close_reason,
            exit_price: r.exit_price,
            exchange_order_id: r.exchange_order_id,
            protection_order_id: r.protection_order_id,
            cycle_id: r.cycle_id,
        })
    }
}

/// Decision audit row as stored
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DecisionAuditRow {
    pub id: i64,
    pub cycle_id: String,
    pub symbol: String,
    pub provider: String,
    pub stage: String,
    pub action: Option<String>,
    pub confidence: Option<i64>,
    pub input_context: String,
    pub raw_output: String,
    pub latency_ms: Option<i64>,
    pub reason: String,
    pub policy_version: String,
    pub created_at: DateTime<Utc>,
}

impl DecisionAuditRow {
    pub fn into_record(self) -> DecisionAuditRecord {
        DecisionAuditRecord {
            stage: self.stage.parse().unwrap_or(Stage::Final),
            action: self.action.as_deref().map(normalize_action),
            confidence: self.confidence.and_then(|c| u8::try_from(c).ok()),
            input_context: serde_json::from_str(&self.input_context).unwrap_or_default(),
            raw_output: serde_json::from_str(&self.raw_output).unwrap_or_default(),
            latency_ms: self.latency_ms.and_then(|l| u64::try_from(l).ok()),
            cycle_id: self.cycle_id,
            symbol: self.symbol,
            provider: self.provider,
            reason: self.reason,
            policy_version: self.policy_version,
            created_at: self.created_at,
        }
    }
}
