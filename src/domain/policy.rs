//! Safety Policy
//!
//! Every threshold that can veto, block or bound a trade lives here, under a
//! single version string that is logged with each decision. Services receive
//! only the sub-policy they need.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const POLICY_VERSION: &str = "2026.10.1";

/// Consensus thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    /// Minimum surviving providers needed to decide anything but NO_TRADE
    pub quorum: usize,
    /// A NO_TRADE vote at or above this confidence forces NO_TRADE
    pub no_trade_veto_confidence: u8,
    /// Max allowed confidence spread among providers agreeing on the winner
    pub deviation_threshold: u8,
    /// Max relative deviation of leverage/stop/take from the voters' median
    pub level_deviation_threshold: f64,
    /// Leverage values a provider may propose
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Bounds applied to the aggregated leverage
    pub consensus_min_leverage: u32,
    pub consensus_max_leverage: u32,
    /// Vetoes per symbol before the symbol goes manage-only
    pub veto_limit: u32,
    #[serde(with = "duration_secs")]
    pub veto_window: Duration,
    #[serde(with = "duration_secs")]
    pub provider_timeout: Duration,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            quorum: 1,
            no_trade_veto_confidence: 90,
            deviation_threshold: 20,
            level_deviation_threshold: 0.20,
            min_leverage: 3,
            max_leverage: 75,
            consensus_min_leverage: 3,
            consensus_max_leverage: 15,
            veto_limit: 5,
            veto_window: Duration::from_secs(3600),
            provider_timeout: Duration::from_secs(60),
        }
    }
}

/// Admission-control thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// Required stop distance is `liquidation_safety_factor / leverage`
    pub liquidation_safety_factor: f64,
    pub funding_window_minutes: i64,
    pub funding_limit_bps: f64,
    pub correlation_threshold: f64,
    pub correlation_bars: usize,
    pub correlation_interval: String,
    pub beta_benchmark: String,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            liquidation_safety_factor: 1.0,
            funding_window_minutes: 5,
            funding_limit_bps: 30.0,
            correlation_threshold: 0.85,
            correlation_bars: 60,
            correlation_interval: "5".to_string(),
            beta_benchmark: "BTCUSDT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingPolicy {
    pub qty_step: f64,
    pub min_qty: f64,
    /// Share of equity that may ever be committed as initial margin
    pub max_im_share_of_equity: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            qty_step: 0.001,
            min_qty: 0.001,
            max_im_share_of_equity: 0.8,
        }
    }
}

/// Stop and target bounds, as fractions of price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    pub atr_multiplier: f64,
    pub reward_ratio: f64,
    pub fallback_volatility: f64,
    pub sl_min_pct: f64,
    pub sl_max_pct: f64,
    pub tp_min_pct: f64,
    pub tp_max_pct: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            atr_multiplier: 1.5,
            reward_ratio: 2.0,
            fallback_volatility: 0.003,
            sl_min_pct: 0.001,
            sl_max_pct: 0.10,
            tp_min_pct: 0.003,
            tp_max_pct: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicyConfig {
    pub slippage_cap_bps: u32,
    /// Fraction of the remaining quantity sent per TWAP chunk
    pub twap_chunk_fraction: f64,
    #[serde(with = "duration_secs")]
    pub twap_chunk_interval: Duration,
    /// How long an unfilled post-only order may rest before it is cancelled
    #[serde(with = "duration_secs")]
    pub post_only_wait: Duration,
    /// Opens stay blocked this long after a resting order could not be cancelled
    #[serde(with = "duration_secs")]
    pub resting_order_ttl: Duration,
    pub extreme_volatility: f64,
    pub liquidity_crisis_score: f64,
}

impl Default for ExecutionPolicyConfig {
    fn default() -> Self {
        Self {
            slippage_cap_bps: 50,
            twap_chunk_fraction: 0.25,
            twap_chunk_interval: Duration::from_secs(120),
            post_only_wait: Duration::from_secs(5),
            resting_order_ttl: Duration::from_secs(900),
            extreme_volatility: 0.05,
            liquidity_crisis_score: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPolicy {
    pub orphan_take_profit_pct: f64,
    pub orphan_stop_loss_pct: f64,
    #[serde(with = "duration_secs")]
    pub execution_lookback: Duration,
    #[serde(with = "duration_secs")]
    pub gap_threshold: Duration,
    #[serde(with = "duration_secs")]
    pub gap_preroll: Duration,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            orphan_take_profit_pct: 0.02,
            orphan_stop_loss_pct: 0.01,
            execution_lookback: Duration::from_secs(24 * 3600),
            gap_threshold: Duration::from_secs(30),
            gap_preroll: Duration::from_secs(5),
        }
    }
}

/// Versioned bundle of all safety constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub version: String,
    pub consensus: ConsensusPolicy,
    pub risk: RiskPolicy,
    pub sizing: SizingPolicy,
    pub stops: StopPolicy,
    pub execution: ExecutionPolicyConfig,
    pub reconciliation: ReconciliationPolicy,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            consensus: ConsensusPolicy::default(),
            risk: RiskPolicy::default(),
            sizing: SizingPolicy::default(),
            stops: StopPolicy::default(),
            execution: ExecutionPolicyConfig::default(),
            reconciliation: ReconciliationPolicy::default(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_carries_version() {
        let policy = SafetyPolicy::default();
        assert_eq!(policy.version, POLICY_VERSION);
        assert_eq!(policy.consensus.deviation_threshold, 20);
        assert_eq!(policy.consensus.no_trade_veto_confidence, 90);
        assert_eq!(policy.consensus.veto_limit, 5);
        assert!((policy.risk.correlation_threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_json_roundtrip_keeps_durations() {
        let policy = SafetyPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let back: SafetyPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
        assert_eq!(back.consensus.veto_window, Duration::from_secs(3600));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut value = serde_json::to_value(SafetyPolicy::default()).unwrap();
        value["reconciliation"]["gap_threshold"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<SafetyPolicy>(value).is_err());
    }
}
