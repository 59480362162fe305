//! Provider decisions and the canonical action vocabulary

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::domain::errors::ValidationError;

/// Canonical trading actions
///
/// Declaration order doubles as the conservative tie-break rank used by the
/// consensus engine: later variants win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Long,
    Short,
    Close,
    Hold,
    NoTrade,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Long,
        Action::Short,
        Action::Close,
        Action::Hold,
        Action::NoTrade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Long => "LONG",
            Action::Short => "SHORT",
            Action::Close => "CLOSE",
            Action::Hold => "HOLD",
            Action::NoTrade => "NO_TRADE",
        }
    }

    /// True for actions that would open a new position
    pub fn is_open_intent(&self) -> bool {
        matches!(self, Action::Long | Action::Short)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map free-text provider output onto the canonical vocabulary.
///
/// Matching ignores case, surrounding whitespace and the choice of `-`, space
/// or `_` as separator. Anything unrecognised becomes HOLD.
pub fn normalize_action(raw: &str) -> Action {
    let key: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect();

    match key.as_str() {
        "LONG" | "BUY" | "BUY_LONG" | "LONG_BUY" | "GO_LONG" | "LONG_POSITION" => Action::Long,
        "SHORT" | "SELL" | "SELL_SHORT" | "SHORT_SELL" | "GO_SHORT" | "SHORT_POSITION" => {
            Action::Short
        }
        "HOLD" | "WAIT" | "PASS" | "SKIP" | "STAY_PUT" | "NEUTRAL" => Action::Hold,
        "CLOSE" | "EXIT" | "CLOSE_POSITION" | "LIQUIDATE" | "CLOSE_ALL" => Action::Close,
        "NO_TRADE" | "NOTRADE" | "NONE" | "NO_OPEN" | "NO_ACTION" | "STAY" | "ABSTAIN"
        | "AVOID" => Action::NoTrade,
        _ => Action::Hold,
    }
}

/// Decision round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    R1,
    R2,
    #[serde(rename = "FINAL")]
    Final,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::R1 => "R1",
            Stage::R2 => "R2",
            Stage::Final => "FINAL",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "R1" => Ok(Stage::R1),
            "R2" => Ok(Stage::R2),
            "FINAL" => Ok(Stage::Final),
            other => Err(ValidationError::InvalidStage(other.to_string())),
        }
    }
}

/// One provider's opinion for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDecision {
    provider: String,
    stage: Stage,
    action: Action,
    confidence: u8,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    leverage: Option<u32>,
    qty_delta_factor: f64,
    reason: String,
    raw: Value,
}

impl ProviderDecision {
    /// Build a decision, rejecting a confidence outside 0..=100
    pub fn new(
        provider: impl Into<String>,
        stage: Stage,
        action: Action,
        confidence: i64,
    ) -> Result<Self, ValidationError> {
        if !(0..=100).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            provider: provider.into(),
            stage,
            action,
            confidence: confidence as u8,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            qty_delta_factor: 0.0,
            reason: String::new(),
            raw: Value::Null,
        })
    }

    pub fn with_stops(
        mut self,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Self, ValidationError> {
        for (field, value) in [("stop_loss", stop_loss), ("take_profit", take_profit)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(ValidationError::MustBeFinite(field.to_string()));
                }
            }
        }
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        Ok(self)
    }

    pub fn with_qty_delta_factor(mut self, factor: f64) -> Result<Self, ValidationError> {
        if !factor.is_finite() || !(-1.0..=1.0).contains(&factor) {
            return Err(ValidationError::QtyDeltaFactorOutOfRange(factor));
        }
        self.qty_delta_factor = factor;
        Ok(self)
    }

    pub fn with_leverage(mut self, leverage: Option<u32>) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    /// Parse a provider's JSON reply at the ingestion boundary.
    ///
    /// Accepts `action` as any synonym understood by [`normalize_action`],
    /// numbers or numeric strings for numeric fields, and both snake_case and
    /// camelCase keys. The original payload is kept as `raw`.
    pub fn from_json(
        provider: impl Into<String>,
        stage: Stage,
        value: &Value,
    ) -> Result<Self, ValidationError> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .map(normalize_action)
            .ok_or_else(|| ValidationError::MissingField("action".to_string()))?;

        let confidence = number_field(value, &["confidence"])?
            .ok_or_else(|| ValidationError::MissingField("confidence".to_string()))?;
        if !confidence.is_finite() {
            return Err(ValidationError::MustBeFinite("confidence".to_string()));
        }

        let stop_loss = number_field(value, &["stop_loss", "stopLoss"])?;
        let take_profit = number_field(value, &["take_profit", "takeProfit"])?;
        let leverage = number_field(value, &["leverage"])?
            .filter(|l| l.is_finite() && *l > 0.0)
            .map(|l| l.round() as u32);
        let factor = number_field(value, &["qty_delta_factor", "qtyDeltaFactor"])?.unwrap_or(0.0);
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Self::new(provider, stage, action, confidence.round() as i64)?
            .with_stops(stop_loss, take_profit)?
            .with_qty_delta_factor(factor)
            .map(|d| {
                d.with_leverage(leverage)
                    .with_reason(reason)
                    .with_raw(value.clone())
            })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn stop_loss(&self) -> Option<f64> {
        self.stop_loss
    }

    pub fn take_profit(&self) -> Option<f64> {
        self.take_profit
    }

    pub fn leverage(&self) -> Option<u32> {
        self.leverage
    }

    pub fn qty_delta_factor(&self) -> f64 {
        self.qty_delta_factor
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Compact form fed back to providers in the second round
    pub fn summary(&self) -> RoundSummaryEntry {
        RoundSummaryEntry {
            provider: self.provider.clone(),
            action: self.action,
            confidence: self.confidence,
            leverage: self.leverage,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            reason: self.reason.clone(),
        }
    }
}

/// First-round opinion as shown to providers in the second round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummaryEntry {
    pub provider: String,
    pub action: Action,
    pub confidence: u8,
    pub leverage: Option<u32>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reason: String,
}

fn number_field(value: &Value, keys: &[&str]) -> Result<Option<f64>, ValidationError> {
    for key in keys {
        match value.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => return Ok(n.as_f64()),
            Some(Value::String(s)) => {
                return s
                    .trim()
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| ValidationError::MustBeFinite((*key).to_string()));
            }
            Some(_) => return Err(ValidationError::MustBeFinite((*key).to_string())),
        }
    }
    Ok(None)
}
