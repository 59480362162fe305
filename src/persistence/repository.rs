//! Database Repository
//!
//! SQLite implementations of the trade store and the decision audit sink.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

use super::models::{DecisionAuditRow, TradeRecord};
use super::DbPool;
use crate::domain::entities::audit::DecisionAuditRecord;
use crate::domain::entities::trade::{Provenance, Trade};
use crate::domain::errors::{AuditError, StoreError};
use crate::domain::repositories::audit_sink::DecisionAuditSink;
use crate::domain::repositories::trade_store::TradeStore;

fn backend(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    StoreError::Backend(format!("{}: {}", context, e))
}

fn to_trades(records: Vec<TradeRecord>) -> Result<Vec<Trade>, StoreError> {
    records.into_iter().map(Trade::try_from).collect()
}

pub struct SqliteTradeStore {
    pool: DbPool,
}

impl SqliteTradeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Closed and cancelled trades, newest first
    pub async fn history(&self, limit: i64) -> Result<Vec<Trade>, StoreError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE status != 'OPEN' ORDER BY closed_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to load trade history", e))?;
        to_trades(records)
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn insert_open(&self, trade: &Trade) -> Result<bool, StoreError> {
        let r = TradeRecord::from(trade);
        let rows = sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades (
                id, symbol, side, qty, entry_price, leverage, stop_loss, take_profit,
                status, provenance, realized_pnl, fees, exit_price, close_reason,
                exchange_order_id, protection_order_id, cycle_id, opened_at, closed_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
            WHERE ?21 = 0 OR NOT EXISTS (
                SELECT 1 FROM trades WHERE status = 'OPEN' AND symbol = ?2 AND side = ?3
            )
            "#,
        )
        .bind(&r.id)
        .bind(&r.symbol)
        .bind(&r.side)
        .bind(r.qty)
        .bind(r.entry_price)
        .bind(r.leverage)
        .bind(r.stop_loss)
        .bind(r.take_profit)
        .bind(&r.status)
        .bind(&r.provenance)
        .bind(r.realized_pnl)
        .bind(r.fees)
        .bind(r.exit_price)
        .bind(&r.close_reason)
        .bind(&r.exchange_order_id)
        .bind(&r.protection_order_id)
        .bind(&r.cycle_id)
        .bind(r.opened_at)
        .bind(r.closed_at)
        .bind(Utc::now())
        .bind(trade.provenance == Provenance::ReconciliationOrphan)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("Failed to insert trade", e))?
        .rows_affected();

        if rows == 0 {
            debug!(symbol = %r.symbol, provenance = %r.provenance, "OPEN trade already exists, insert ignored");
        } else {
            debug!(trade_id = %r.id, symbol = %r.symbol, "trade inserted");
        }
        Ok(rows == 1)
    }

    async fn update_open(&self, trade: &Trade) -> Result<(), StoreError> {
        let r = TradeRecord::from(trade);
        let rows = sqlx::query(
            r#"
            UPDATE trades
            SET qty = ?1, stop_loss = ?2, take_profit = ?3, status = ?4, realized_pnl = ?5,
                fees = ?6, exit_price = ?7, close_reason = ?8, protection_order_id = ?9,
                closed_at = ?10, leverage = ?11, updated_at = ?12
            WHERE id = ?13 AND status = 'OPEN'
            "#,
        )
        .bind(r.qty)
        .bind(r.stop_loss)
        .bind(r.take_profit)
        .bind(&r.status)
        .bind(r.realized_pnl)
        .bind(r.fees)
        .bind(r.exit_price)
        .bind(&r.close_reason)
        .bind(&r.protection_order_id)
        .bind(r.closed_at)
        .bind(r.leverage)
        .bind(Utc::now())
        .bind(&r.id)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("Failed to update trade", e))?
        .rows_affected();

        if rows == 1 {
            debug!(trade_id = %r.id, status = %r.status, "trade updated");
            return Ok(());
        }
        match self.get(&r.id).await? {
            Some(_) => Err(StoreError::NotOpen(r.id)),
            None => Err(StoreError::NotFound(r.id)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Trade>, StoreError> {
        let record = sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("Failed to get trade", e))?;
        record.map(Trade::try_from).transpose()
    }

    async fn open_trades(&self) -> Result<Vec<Trade>, StoreError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE status = 'OPEN' ORDER BY opened_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to get open trades", e))?;
        to_trades(records)
    }

    async fn open_trades_for_symbol(&self, symbol: &str) -> Result<Vec<Trade>, StoreError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE status = 'OPEN' AND symbol = ?1 ORDER BY opened_at ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to get open trades for symbol", e))?;
        to_trades(records)
    }
}

/// Append-only decision audit trail; exposes no update or delete
pub struct DecisionAuditRepository {
    pool: DbPool,
}

impl DecisionAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn for_cycle(&self, cycle_id: &str) -> Result<Vec<DecisionAuditRecord>, AuditError> {
        let rows = sqlx::query_as::<_, DecisionAuditRow>(
            "SELECT * FROM decision_audit WHERE cycle_id = ?1 ORDER BY id ASC",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AuditError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(DecisionAuditRow::into_record).collect())
    }
}

#[async_trait]
impl DecisionAuditSink for DecisionAuditRepository {
    async fn append(&self, records: &[DecisionAuditRecord]) -> Result<(), AuditError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AuditError::Backend(e.to_string()))?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO decision_audit (
                    cycle_id, symbol, provider, stage, action, confidence,
                    input_context, raw_output, latency_ms, reason, policy_version, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(&record.cycle_id)
            .bind(&record.symbol)
            .bind(&record.provider)
            .bind(record.stage.as_str())
            .bind(record.action.map(|a| a.as_str()))
            .bind(record.confidence.map(i64::from))
            .bind(record.input_context.to_string())
            .bind(record.raw_output.to_string())
            .bind(record.latency_ms.map(|l| l as i64))
            .bind(&record.reason)
            .bind(&record.policy_version)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        debug!(rows = records.len(), "decision audit appended");
        Ok(())
    }
}
