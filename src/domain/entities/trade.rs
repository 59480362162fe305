//! Trade entity
//!
//! A `Trade` is immutable. Every change goes through a transition function
//! that returns the next snapshot plus the side effects the caller must
//! apply (persist, attach protection, notify). Closed and cancelled trades
//! are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::entities::market::Side;
use crate::domain::errors::{TradeTransitionError, ValidationError};
use crate::domain::repositories::alert_dispatcher::AlertLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Open)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            "CANCELLED" => Ok(TradeStatus::Cancelled),
            other => Err(format!("unknown trade status {other}")),
        }
    }
}

/// Where a trade came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Cycle,
    ReconciliationOrphan,
    Manual,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Cycle => "CYCLE",
            Provenance::ReconciliationOrphan => "RECONCILIATION_ORPHAN",
            Provenance::Manual => "MANUAL",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CYCLE" => Ok(Provenance::Cycle),
            "RECONCILIATION_ORPHAN" => Ok(Provenance::ReconciliationOrphan),
            "MANUAL" => Ok(Provenance::Manual),
            other => Err(format!("unknown provenance {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    ConsensusClose,
    ExternalReconciliation,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ConsensusClose => "CONSENSUS_CLOSE",
            CloseReason::ExternalReconciliation => "EXTERNAL_RECONCILIATION",
            CloseReason::Manual => "MANUAL",
        }
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSENSUS_CLOSE" => Ok(CloseReason::ConsensusClose),
            "EXTERNAL_RECONCILIATION" => Ok(CloseReason::ExternalReconciliation),
            "MANUAL" => Ok(CloseReason::Manual),
            other => Err(format!("unknown close reason {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: TradeStatus,
    pub realized_pnl: Option<f64>,
    pub fees: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub provenance: Provenance,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<f64>,
    pub exchange_order_id: Option<String>,
    pub protection_order_id: Option<String>,
    pub cycle_id: Option<String>,
}

/// Input for opening a trade from a confirmed fill
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub fees: f64,
    pub provenance: Provenance,
    pub exchange_order_id: Option<String>,
    pub cycle_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum TradeCommand {
    Persist(Trade),
    AttachProtection {
        trade_id: String,
        symbol: String,
        side: Side,
        qty: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    ReplaceProtection {
        trade_id: String,
        symbol: String,
        side: Side,
        qty: f64,
        previous_order_id: Option<String>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    CloseOnExchange {
        trade_id: String,
        symbol: String,
        side: Side,
        qty: f64,
    },
    Notify {
        level: AlertLevel,
        code: String,
        message: String,
    },
}

pub type Transition = (Trade, Vec<TradeCommand>);

/// Check stop < entry < take for longs, the mirror for shorts
pub fn validate_levels(
    side: Side,
    entry: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Result<(), ValidationError> {
    if !entry.is_finite() || entry <= 0.0 {
        return Err(ValidationError::MustBePositive {
            field: "entry_price".to_string(),
            value: entry,
        });
    }
    let sl_ok = stop_loss.map_or(true, |sl| {
        sl.is_finite()
            && sl > 0.0
            && match side {
                Side::Long => sl < entry,
                Side::Short => sl > entry,
            }
    });
    let tp_ok = take_profit.map_or(true, |tp| {
        tp.is_finite()
            && tp > 0.0
            && match side {
                Side::Long => tp > entry,
                Side::Short => tp < entry,
            }
    });
    if sl_ok && tp_ok {
        Ok(())
    } else {
        Err(ValidationError::StopOrdering {
            side: side.to_string(),
            stop_loss,
            entry,
            take_profit,
        })
    }
}

fn validate_qty(qty: f64) -> Result<(), ValidationError> {
    if !qty.is_finite() || qty <= 0.0 {
        return Err(ValidationError::MustBePositive {
            field: "qty".to_string(),
            value: qty,
        });
    }
    Ok(())
}

impl Trade {
    /// Create an OPEN trade from a confirmed fill
    pub fn open(new: NewTrade) -> Result<Transition, ValidationError> {
        validate_qty(new.qty)?;
        validate_levels(new.side, new.entry_price, new.stop_loss, new.take_profit)?;

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            symbol: new.symbol,
            side: new.side,
            qty: new.qty,
            entry_price: new.entry_price,
            leverage: new.leverage.max(1),
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            status: TradeStatus::Open,
            realized_pnl: None,
            fees: new.fees,
            opened_at: new.opened_at,
            closed_at: None,
            provenance: new.provenance,
            close_reason: None,
            exit_price: None,
            exchange_order_id: new.exchange_order_id,
            protection_order_id: None,
            cycle_id: new.cycle_id,
        };

        let mut commands = vec![TradeCommand::Persist(trade.clone())];
        if trade.stop_loss.is_some() || trade.take_profit.is_some() {
            commands.push(trade.attach_protection_command());
        }
        commands.push(TradeCommand::Notify {
            level: AlertLevel::Info,
            code: "TRADE_OPENED".to_string(),
            message: format!(
                "Opened {} {} qty={} @ {}",
                trade.side, trade.symbol, trade.qty, trade.entry_price
            ),
        });
        Ok((trade, commands))
    }

    /// Adopt a position the exchange reports but the local book lacks.
    ///
    /// Protective levels are placed at `take_pct` / `stop_pct` from the
    /// position's average price.
    pub fn adopt_orphan(
        symbol: &str,
        side: Side,
        qty: f64,
        avg_price: f64,
        take_pct: f64,
        stop_pct: f64,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        let (stop_loss, take_profit) = match side {
            Side::Long => (avg_price * (1.0 - stop_pct), avg_price * (1.0 + take_pct)),
            Side::Short => (avg_price * (1.0 + stop_pct), avg_price * (1.0 - take_pct)),
        };
        let (trade, mut commands) = Trade::open(NewTrade {
            symbol: symbol.to_string(),
            side,
            qty: qty.abs(),
            entry_price: avg_price,
            leverage: 1,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            fees: 0.0,
            provenance: Provenance::ReconciliationOrphan,
            exchange_order_id: None,
            cycle_id: None,
            opened_at: now,
        })?;
        for command in commands.iter_mut() {
            if let TradeCommand::Notify { level, code, message } = command {
                *level = AlertLevel::Warn;
                *code = "RECONCILIATION_ORPHAN".to_string();
                *message = format!(
                    "Adopted orphan {} {} qty={} @ {}",
                    trade.side, trade.symbol, trade.qty, trade.entry_price
                );
            }
        }
        Ok((trade, commands))
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    fn ensure_open(&self) -> Result<(), TradeTransitionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TradeTransitionError::NotOpen {
                id: self.id.clone(),
                status: self.status,
            })
        }
    }

    fn attach_protection_command(&self) -> TradeCommand {
        TradeCommand::AttachProtection {
            trade_id: self.id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            qty: self.qty,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        }
    }

    /// Record the exchange id of the protective order pair
    pub fn with_protection_order(&self, order_id: impl Into<String>) -> Transition {
        let next = Trade {
            protection_order_id: Some(order_id.into()),
            ..self.clone()
        };
        (next.clone(), vec![TradeCommand::Persist(next)])
    }

    /// Move stop loss and/or take profit. `None` keeps the current level.
    pub fn amend_stops(
        &self,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Transition, TradeTransitionError> {
        self.ensure_open()?;
        let new_sl = stop_loss.or(self.stop_loss);
        let new_tp = take_profit.or(self.take_profit);
        validate_levels(self.side, self.entry_price, new_sl, new_tp)?;

        if new_sl == self.stop_loss && new_tp == self.take_profit {
            return Ok((self.clone(), Vec::new()));
        }

        let next = Trade {
            stop_loss: new_sl,
            take_profit: new_tp,
            ..self.clone()
        };
        let commands = vec![
            TradeCommand::Persist(next.clone()),
            TradeCommand::ReplaceProtection {
                trade_id: next.id.clone(),
                symbol: next.symbol.clone(),
                side: next.side,
                qty: next.qty,
                previous_order_id: self.protection_order_id.clone(),
                stop_loss: new_sl,
                take_profit: new_tp,
            },
            TradeCommand::Notify {
                level: AlertLevel::Info,
                code: "TRADE_AMENDED".to_string(),
                message: format!(
                    "Amended {} stops: sl {:?} -> {:?}, tp {:?} -> {:?}",
                    self.symbol, self.stop_loss, new_sl, self.take_profit, new_tp
                ),
            },
        ];
        Ok((next, commands))
    }

    /// Realized PnL for exiting the whole position at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        match self.side {
            Side::Long => (exit_price - self.entry_price) * self.qty,
            Side::Short => (self.entry_price - exit_price) * self.qty,
        }
    }

    /// Ask for a reduce-only close on the exchange, without changing state
    pub fn request_close(&self) -> Result<Vec<TradeCommand>, TradeTransitionError> {
        self.ensure_open()?;
        Ok(vec![TradeCommand::CloseOnExchange {
            trade_id: self.id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            qty: self.qty,
        }])
    }

    /// Mark the trade closed at a realized exit price
    pub fn close(
        &self,
        exit_price: f64,
        exit_fees: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<Transition, TradeTransitionError> {
        self.ensure_open()?;
        if !exit_price.is_finite() || exit_price <= 0.0 {
            return Err(ValidationError::MustBePositive {
                field: "exit_price".to_string(),
                value: exit_price,
            }
            .into());
        }
        let fees = self.fees + exit_fees.max(0.0);
        let pnl = self.pnl_at(exit_price) - fees;
        let next = Trade {
            status: TradeStatus::Closed,
            realized_pnl: Some(pnl),
            fees,
            exit_price: Some(exit_price),
            closed_at: Some(at),
            close_reason: Some(reason),
            ..self.clone()
        };
        let commands = vec![
            TradeCommand::Persist(next.clone()),
            TradeCommand::Notify {
                level: AlertLevel::Info,
                code: "TRADE_CLOSED".to_string(),
                message: format!(
                    "Closed {} {} @ {} pnl={:.4} ({})",
                    next.side,
                    next.symbol,
                    exit_price,
                    pnl,
                    reason.as_str()
                ),
            },
        ];
        Ok((next, commands))
    }

    /// Cancel a trade that never became a real exposure
    pub fn cancel(&self, at: DateTime<Utc>) -> Result<Transition, TradeTransitionError> {
        self.ensure_open()?;
        let next = Trade {
            status: TradeStatus::Cancelled,
            closed_at: Some(at),
            realized_pnl: Some(0.0),
            ..self.clone()
        };
        Ok((next.clone(), vec![TradeCommand::Persist(next)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_long() -> NewTrade {
        NewTrade {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: 0.5,
            entry_price: 50_000.0,
            leverage: 10,
            stop_loss: Some(49_000.0),
            take_profit: Some(52_000.0),
            fees: 1.0,
            provenance: Provenance::Cycle,
            exchange_order_id: Some("ex-1".to_string()),
            cycle_id: Some("cycle-1".to_string()),
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_emits_persist_protection_and_notify() {
        let (trade, commands) = Trade::open(new_long()).unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert!(matches!(commands[0], TradeCommand::Persist(_)));
        assert!(matches!(commands[1], TradeCommand::AttachProtection { .. }));
        assert!(matches!(commands[2], TradeCommand::Notify { .. }));
    }

    #[test]
    fn test_open_rejects_misordered_long_levels() {
        let mut new = new_long();
        new.stop_loss = Some(51_000.0);
        assert!(matches!(
            Trade::open(new),
            Err(ValidationError::StopOrdering { .. })
        ));
    }

    #[test]
    fn test_short_levels_are_mirrored() {
        assert!(validate_levels(Side::Short, 100.0, Some(105.0), Some(90.0)).is_ok());
        assert!(validate_levels(Side::Short, 100.0, Some(95.0), Some(90.0)).is_err());
        assert!(validate_levels(Side::Short, 100.0, None, Some(101.0)).is_err());
    }

    #[test]
    fn test_adopt_orphan_places_protection_around_avg_price() {
        let (trade, commands) =
            Trade::adopt_orphan("ETHUSDT", Side::Short, -2.0, 2_000.0, 0.02, 0.01, Utc::now())
                .unwrap();
        assert_eq!(trade.provenance, Provenance::ReconciliationOrphan);
        assert_eq!(trade.qty, 2.0);
        assert_eq!(trade.leverage, 1);
        assert!((trade.stop_loss.unwrap() - 2_020.0).abs() < 1e-9);
        assert!((trade.take_profit.unwrap() - 1_960.0).abs() < 1e-9);
        assert!(commands.iter().any(|c| matches!(
            c,
            TradeCommand::Notify { code, .. } if code == "RECONCILIATION_ORPHAN"
        )));
    }

    #[test]
    fn test_amend_replaces_protection() {
        let (trade, _) = Trade::open(new_long()).unwrap();
        let (trade, _) = trade.with_protection_order("oco-1");
        let (next, commands) = trade.amend_stops(Some(49_500.0), None).unwrap();
        assert_eq!(next.stop_loss, Some(49_500.0));
        assert_eq!(next.take_profit, Some(52_000.0));
        assert!(commands.iter().any(|c| matches!(
            c,
            TradeCommand::ReplaceProtection { previous_order_id: Some(id), .. } if id == "oco-1"
        )));
        // original snapshot is untouched
        assert_eq!(trade.stop_loss, Some(49_000.0));
    }

    #[test]
    fn test_amend_without_change_is_noop() {
        let (trade, _) = Trade::open(new_long()).unwrap();
        let (next, commands) = trade.amend_stops(None, None).unwrap();
        assert_eq!(next, trade);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_close_computes_pnl_net_of_fees() {
        let (trade, _) = Trade::open(new_long()).unwrap();
        let (closed, _) = trade
            .close(51_000.0, 1.5, CloseReason::ExternalReconciliation, Utc::now())
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        // (51000 - 50000) * 0.5 - (1.0 + 1.5)
        assert!((closed.realized_pnl.unwrap() - 497.5).abs() < 1e-9);
        assert_eq!(closed.close_reason, Some(CloseReason::ExternalReconciliation));
    }

    #[test]
    fn test_short_pnl_sign() {
        let mut new = new_long();
        new.side = Side::Short;
        new.stop_loss = Some(51_000.0);
        new.take_profit = Some(48_000.0);
        let (trade, _) = Trade::open(new).unwrap();
        assert!((trade.pnl_at(49_000.0) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let (trade, _) = Trade::open(new_long()).unwrap();
        let (closed, _) = trade
            .close(50_500.0, 0.0, CloseReason::Manual, Utc::now())
            .unwrap();
        assert!(matches!(
            closed.close(50_600.0, 0.0, CloseReason::Manual, Utc::now()),
            Err(TradeTransitionError::NotOpen { .. })
        ));
        assert!(closed.amend_stops(Some(49_800.0), None).is_err());
        assert!(closed.request_close().is_err());

        let (cancelled, _) = trade.cancel(Utc::now()).unwrap();
        assert!(cancelled.status.is_terminal());
        assert!(cancelled.cancel(Utc::now()).is_err());
    }
}
