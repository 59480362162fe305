//! Risk Gate
//!
//! Composite admission control for new positions. Gates run in a fixed
//! order and the first failure decides the verdict:
//! 1. liquidation buffer (stop distance vs. leverage)
//! 2. funding window
//! 3. correlation with already-open symbols
//!
//! A rejection is a normal [`RiskVerdict`], never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::entities::market::{FundingInfo, Side};
use crate::domain::policy::RiskPolicy;
use crate::domain::services::correlation::CorrelationService;
use crate::domain::services::funding_guard::FundingGuard;

pub const INVALID_ENTRY_PRICE: &str = "INVALID_ENTRY_PRICE";
pub const INVALID_LEVERAGE: &str = "INVALID_LEVERAGE";
pub const INVALID_STOP_LOSS: &str = "INVALID_STOP_LOSS";
pub const LIQ_BUFFER_INSUFFICIENT: &str = "LIQ_BUFFER_INSUFFICIENT";
pub const HIGH_CORRELATION_BLOCK: &str = "HIGH_CORRELATION_BLOCK";
pub const CORRELATION_DATA_UNAVAILABLE: &str = "CORRELATION_DATA_UNAVAILABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskGateCode {
    Liquidation,
    Funding,
    Correlation,
}

impl fmt::Display for RiskGateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskGateCode::Liquidation => write!(f, "LIQUIDATION"),
            RiskGateCode::Funding => write!(f, "FUNDING"),
            RiskGateCode::Correlation => write!(f, "CORRELATION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub ok: bool,
    /// Gate that rejected; `None` when ok
    pub gate: Option<RiskGateCode>,
    pub reason_code: Option<String>,
    pub message: String,
    pub distance_pct: Option<f64>,
    pub min_required_pct: Option<f64>,
    /// Strongest |ρ| against an open symbol
    pub correlation: Option<f64>,
    pub correlated_with: Option<String>,
    pub beta: Option<f64>,
}

impl RiskVerdict {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            gate: None,
            reason_code: None,
            message: message.into(),
            distance_pct: None,
            min_required_pct: None,
            correlation: None,
            correlated_with: None,
            beta: None,
        }
    }

    fn reject(gate: RiskGateCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            gate: Some(gate),
            reason_code: Some(code.to_string()),
            ..Self::pass(message)
        }
    }
}

/// A position the caller wants to open
#[derive(Debug, Clone)]
pub struct OpenCandidate {
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub funding: Option<FundingInfo>,
    /// Symbols that currently hold an OPEN trade
    pub open_symbols: Vec<String>,
    pub now: DateTime<Utc>,
}

pub struct RiskGate {
    policy: RiskPolicy,
    funding: FundingGuard,
    correlation: Arc<CorrelationService>,
}

impl RiskGate {
    pub fn new(policy: RiskPolicy, correlation: Arc<CorrelationService>) -> Self {
        Self {
            funding: FundingGuard::from_policy(&policy),
            policy,
            correlation,
        }
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Liquidation-buffer check alone
    ///
    /// Requires `|entry − stop_loss| / entry ≥ k / leverage`.
    pub fn ok_to_open(
        &self,
        symbol: &str,
        entry: f64,
        side: Side,
        leverage: u32,
        stop_loss: f64,
    ) -> RiskVerdict {
        if !entry.is_finite() || entry <= 0.0 {
            return RiskVerdict::reject(
                RiskGateCode::Liquidation,
                INVALID_ENTRY_PRICE,
                format!("entry price must be positive, got {}", entry),
            );
        }
        if leverage == 0 {
            return RiskVerdict::reject(
                RiskGateCode::Liquidation,
                INVALID_LEVERAGE,
                "leverage must be positive",
            );
        }
        if !stop_loss.is_finite() || stop_loss <= 0.0 {
            return RiskVerdict::reject(
                RiskGateCode::Liquidation,
                INVALID_STOP_LOSS,
                format!("stop loss must be positive, got {}", stop_loss),
            );
        }

        let distance = ((entry - stop_loss) / entry).abs();
        let required = self.policy.liquidation_safety_factor / f64::from(leverage);
        let mut verdict = if distance < required {
            debug!(symbol, side = %side, distance, required, "liquidation buffer insufficient");
            RiskVerdict::reject(
                RiskGateCode::Liquidation,
                LIQ_BUFFER_INSUFFICIENT,
                format!(
                    "stop distance {:.4}% below required {:.4}% at {}x",
                    distance * 100.0,
                    required * 100.0,
                    leverage
                ),
            )
        } else {
            RiskVerdict::pass("liquidation buffer sufficient")
        };
        verdict.distance_pct = Some(distance * 100.0);
        verdict.min_required_pct = Some(required * 100.0);
        verdict
    }

    /// All gates in order, short-circuiting on the first failure
    pub async fn allow_open_with_guards(&self, candidate: &OpenCandidate) -> RiskVerdict {
        let symbol = candidate.symbol.to_uppercase();

        let liquidation = self.ok_to_open(
            &symbol,
            candidate.entry,
            candidate.side,
            candidate.leverage,
            candidate.stop_loss,
        );
        if !liquidation.ok {
            return liquidation;
        }

        let funding = self
            .funding
            .ok_to_open(candidate.funding.as_ref(), candidate.now);
        if !funding.ok {
            return RiskVerdict {
                distance_pct: liquidation.distance_pct,
                min_required_pct: liquidation.min_required_pct,
                ..RiskVerdict::reject(
                    RiskGateCode::Funding,
                    funding.reason.as_deref().unwrap_or("FUNDING_WINDOW_BLOCK"),
                    funding.message,
                )
            };
        }

        let mut verdict = self.correlation_gate(&symbol, &candidate.open_symbols).await;
        verdict.distance_pct = liquidation.distance_pct;
        verdict.min_required_pct = liquidation.min_required_pct;

        verdict.beta = match self
            .correlation
            .beta(&symbol, &self.policy.beta_benchmark)
            .await
        {
            Ok(beta) => Some(beta),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "beta unavailable");
                None
            }
        };
        verdict
    }

    async fn correlation_gate(&self, symbol: &str, open_symbols: &[String]) -> RiskVerdict {
        let others: Vec<String> = open_symbols
            .iter()
            .map(|s| s.to_uppercase())
            .filter(|s| s != symbol)
            .collect();
        if others.is_empty() {
            return RiskVerdict::pass("no open symbols to correlate against");
        }

        let mut symbols = others.clone();
        symbols.push(symbol.to_string());
        let matrix = match self.correlation.matrix(&symbols).await {
            Ok(m) => m,
            Err(e) => {
                // without data the gate cannot prove independence
                warn!(symbol, error = %e, "correlation data unavailable, blocking open");
                return RiskVerdict::reject(
                    RiskGateCode::Correlation,
                    CORRELATION_DATA_UNAVAILABLE,
                    format!("correlation data unavailable: {}", e),
                );
            }
        };

        let Some((with, rho)) = matrix.max_abs_against(symbol, &others) else {
            return RiskVerdict::pass("no correlation pairs");
        };
        let mut verdict = if rho > self.policy.correlation_threshold {
            RiskVerdict::reject(
                RiskGateCode::Correlation,
                HIGH_CORRELATION_BLOCK,
                format!(
                    "|rho| {:.3} with {} exceeds {:.2}",
                    rho, with, self.policy.correlation_threshold
                ),
            )
        } else {
            RiskVerdict::pass("all gates passed")
        };
        verdict.correlation = Some(rho);
        verdict.correlated_with = Some(with);
        verdict
    }
}
