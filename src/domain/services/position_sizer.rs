//! Position sizing
//!
//! Two independent caps on order quantity:
//! - risk sizing: the loss at the stop, plus fees and slippage, must not
//!   exceed `equity × risk_pct`
//! - initial-margin sizing: the margin committed must fit in the margin the
//!   account can spare at its current utilization
//!
//! Both return plain numbers that are always finite and never negative.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::entities::market::{InstrumentInfo, Side};
use crate::domain::policy::SizingPolicy;

/// Account stress bucket derived from margin utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Extreme,
}

impl RiskBand {
    pub fn from_utilization(margin_utilization: f64) -> Self {
        if !margin_utilization.is_finite() {
            return RiskBand::Extreme;
        }
        if margin_utilization < 0.3 {
            RiskBand::Low
        } else if margin_utilization < 0.6 {
            RiskBand::Medium
        } else if margin_utilization < 0.8 {
            RiskBand::High
        } else {
            RiskBand::Extreme
        }
    }

    /// Share of equity this band may commit as initial margin
    pub fn im_multiplier(&self) -> f64 {
        match self {
            RiskBand::Low => 0.15,
            RiskBand::Medium => 0.10,
            RiskBand::High => 0.05,
            RiskBand::Extreme => 0.02,
        }
    }

    pub fn max_leverage(&self) -> u32 {
        match self {
            RiskBand::Low => 25,
            RiskBand::Medium => 15,
            RiskBand::High => 10,
            RiskBand::Extreme => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "low",
            RiskBand::Medium => "medium",
            RiskBand::High => "high",
            RiskBand::Extreme => "extreme",
        }
    }
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest power of ten that makes `step` integral
fn step_scale(step: f64) -> f64 {
    let mut scale = 1.0;
    for _ in 0..12 {
        let scaled = step * scale;
        if (scaled - scaled.round()).abs() < 1e-9 {
            break;
        }
        scale *= 10.0;
    }
    scale
}

/// Inputs to [`PositionSizer::size_by_risk`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskSizingRequest {
    pub side: Side,
    pub entry: f64,
    pub stop_loss: f64,
    pub equity: f64,
    pub leverage: u32,
    pub risk_pct: f64,
    pub fee_rate: f64,
    pub slippage_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImCapResult {
    pub qty: f64,
    pub im_required: f64,
    pub risk_band: RiskBand,
    /// Leverage actually applied after the band cap
    pub leverage: u32,
}

/// PositionSizer service for calculating order quantities
#[derive(Debug, Clone)]
pub struct PositionSizer {
    policy: SizingPolicy,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(SizingPolicy::default())
    }
}

impl PositionSizer {
    pub fn new(policy: SizingPolicy) -> Self {
        Self { policy }
    }

    /// Same sizer, rounding to the instrument's own step and minimum
    pub fn for_instrument(&self, info: &InstrumentInfo) -> Self {
        let mut policy = self.policy.clone();
        if info.qty_step.is_finite() && info.qty_step > 0.0 {
            policy.qty_step = info.qty_step;
        }
        if info.min_qty.is_finite() && info.min_qty > 0.0 {
            policy.min_qty = info.min_qty;
        }
        Self { policy }
    }

    pub fn policy(&self) -> &SizingPolicy {
        &self.policy
    }

    /// Round down to the quantity step; below the minimum quantity yields 0
    pub fn floor_to_step(&self, qty: f64) -> f64 {
        if !qty.is_finite() || qty <= 0.0 {
            return 0.0;
        }
        let step = self.policy.qty_step;
        let floored = if step > 0.0 {
            // tolerance absorbs representation error such as 0.3 / 0.1 = 2.9999…
            let steps = (qty / step + 1e-9).floor();
            let scale = step_scale(step);
            (steps * step * scale).round() / scale
        } else {
            qty
        };
        if floored < self.policy.min_qty || !floored.is_finite() {
            0.0
        } else {
            floored
        }
    }

    /// Size a position so that hitting the stop costs at most `equity × risk_pct`
    ///
    /// qty = equity·risk_pct / (|entry − stop| + fee_rate·entry + slippage_rate·entry)
    ///
    /// The result is also capped at `equity × leverage / entry` notional.
    ///
    /// # Returns
    /// A finite quantity ≥ 0. Any invalid input yields 0.
    pub fn size_by_risk(&self, req: &RiskSizingRequest) -> f64 {
        let inputs = [
            req.entry,
            req.stop_loss,
            req.equity,
            req.risk_pct,
            req.fee_rate,
            req.slippage_rate,
        ];
        if inputs.iter().any(|v| !v.is_finite()) {
            return 0.0;
        }
        if req.entry <= 0.0
            || req.stop_loss <= 0.0
            || req.equity <= 0.0
            || req.risk_pct <= 0.0
            || req.leverage == 0
            || req.fee_rate < 0.0
            || req.slippage_rate < 0.0
        {
            return 0.0;
        }

        let per_unit_loss = (req.entry - req.stop_loss).abs()
            + req.fee_rate * req.entry
            + req.slippage_rate * req.entry;
        if per_unit_loss <= 0.0 {
            return 0.0;
        }

        let by_risk = req.equity * req.risk_pct / per_unit_loss;
        let by_notional = req.equity * f64::from(req.leverage) / req.entry;
        self.floor_to_step(by_risk.min(by_notional))
    }

    /// Cap quantity by the initial margin the account can commit
    ///
    /// # Arguments
    /// * `equity` - Account equity
    /// * `margin_utilization` - Share of equity already used as margin (0..1)
    /// * `free_collateral` - Collateral not yet committed
    /// * `leverage` - Requested leverage; lowered to the band's maximum
    /// * `price` - Expected entry price
    pub fn size_by_im_cap(
        &self,
        equity: f64,
        margin_utilization: f64,
        free_collateral: f64,
        leverage: u32,
        price: f64,
    ) -> ImCapResult {
        let risk_band = RiskBand::from_utilization(margin_utilization);
        let applied_leverage = leverage.min(risk_band.max_leverage());
        let empty = ImCapResult {
            qty: 0.0,
            im_required: 0.0,
            risk_band,
            leverage: applied_leverage,
        };

        if !equity.is_finite()
            || !free_collateral.is_finite()
            || !price.is_finite()
            || equity <= 0.0
            || free_collateral <= 0.0
            || price <= 0.0
            || applied_leverage == 0
        {
            return empty;
        }

        let available_im = free_collateral.min(self.policy.max_im_share_of_equity * equity);
        let im_budget = (equity * risk_band.im_multiplier()).min(available_im);
        let qty = self.floor_to_step(im_budget * f64::from(applied_leverage) / price);
        if qty == 0.0 {
            return empty;
        }

        ImCapResult {
            qty,
            im_required: qty * price / f64::from(applied_leverage),
            risk_band,
            leverage: applied_leverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(entry: f64, stop_loss: f64) -> RiskSizingRequest {
        RiskSizingRequest {
            side: Side::Long,
            entry,
            stop_loss,
            equity: 10_000.0,
            leverage: 10,
            risk_pct: 0.01,
            fee_rate: 0.0,
            slippage_rate: 0.0,
        }
    }

    #[test]
    fn test_risk_budget_matches_loss_at_stop() {
        let sizer = PositionSizer::default();
        let req = request(50_000.0, 49_000.0);
        let qty = sizer.size_by_risk(&req);

        // 100 USD risk over a 1000 USD stop distance
        assert!((qty - 0.1).abs() < 1e-9);
        let loss = qty * (req.entry - req.stop_loss).abs();
        assert!((loss - req.equity * req.risk_pct).abs() <= sizer.policy().qty_step * 1000.0);
    }

    #[test]
    fn test_fees_and_slippage_shrink_quantity() {
        let sizer = PositionSizer::default();
        let plain = sizer.size_by_risk(&request(50_000.0, 49_000.0));
        let costly = sizer.size_by_risk(&RiskSizingRequest {
            fee_rate: 0.0006,
            slippage_rate: 0.0005,
            ..request(50_000.0, 49_000.0)
        });
        assert!(costly < plain);
        assert!(costly > 0.0);
    }

    #[test]
    fn test_short_side_uses_absolute_distance() {
        let sizer = PositionSizer::default();
        let qty = sizer.size_by_risk(&RiskSizingRequest {
            side: Side::Short,
            ..request(50_000.0, 51_000.0)
        });
        assert!((qty - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_inputs_yield_zero() {
        let sizer = PositionSizer::default();
        for req in [
            request(f64::NAN, 49_000.0),
            request(50_000.0, f64::INFINITY),
            request(50_000.0, 50_000.0),
            request(-1.0, 49_000.0),
            RiskSizingRequest { equity: 0.0, ..request(50_000.0, 49_000.0) },
            RiskSizingRequest { leverage: 0, ..request(50_000.0, 49_000.0) },
            RiskSizingRequest { risk_pct: -0.01, ..request(50_000.0, 49_000.0) },
        ] {
            let qty = sizer.size_by_risk(&req);
            assert_eq!(qty, 0.0, "{:?}", req);
        }
    }

    #[test]
    fn test_notional_cap_applies_for_tight_stops() {
        let sizer = PositionSizer::default();
        // 0.01% stop would allow 20 BTC by risk alone; leverage caps at 2 BTC
        let qty = sizer.size_by_risk(&request(50_000.0, 49_995.0));
        assert!((qty - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_minimum_is_zero_not_rounded_up() {
        let sizer = PositionSizer::new(SizingPolicy {
            qty_step: 0.01,
            min_qty: 0.01,
            ..Default::default()
        });
        let qty = sizer.size_by_risk(&RiskSizingRequest {
            equity: 100.0,
            ..request(50_000.0, 45_000.0)
        });
        assert_eq!(qty, 0.0);
    }

    #[test]
    fn test_output_always_finite_and_non_negative() {
        let sizer = PositionSizer::default();
        for entry in [0.5, 10.0, 1_000.0, 65_000.0] {
            for stop_frac in [0.001_f64, 0.01, 0.2, 0.99, 1.5] {
                for risk in [0.0001, 0.01, 0.5] {
                    let qty = sizer.size_by_risk(&RiskSizingRequest {
                        risk_pct: risk,
                        ..request(entry, entry * (1.0 - stop_frac).abs().max(1e-6))
                    });
                    assert!(qty.is_finite() && qty >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_instrument_step_overrides_policy() {
        let sizer = PositionSizer::default().for_instrument(&InstrumentInfo {
            symbol: "ETHUSDT".to_string(),
            tick_size: 0.01,
            qty_step: 0.1,
            min_qty: 0.1,
            max_leverage: 50,
        });
        assert_eq!(sizer.floor_to_step(1.29), 1.2);
        assert_eq!(sizer.floor_to_step(0.3), 0.3);
        assert_eq!(sizer.floor_to_step(0.05), 0.0);
    }

    #[test]
    fn test_risk_band_thresholds() {
        assert_eq!(RiskBand::from_utilization(0.0), RiskBand::Low);
        assert_eq!(RiskBand::from_utilization(0.3), RiskBand::Medium);
        assert_eq!(RiskBand::from_utilization(0.59), RiskBand::Medium);
        assert_eq!(RiskBand::from_utilization(0.6), RiskBand::High);
        assert_eq!(RiskBand::from_utilization(0.8), RiskBand::Extreme);
        assert_eq!(RiskBand::from_utilization(f64::NAN), RiskBand::Extreme);
    }

    #[test]
    fn test_im_cap_low_utilization() {
        let sizer = PositionSizer::default();
        let result = sizer.size_by_im_cap(10_000.0, 0.1, 9_000.0, 10, 50_000.0);
        // 15% of equity as margin, 10x
        assert_eq!(result.risk_band, RiskBand::Low);
        assert_eq!(result.leverage, 10);
        assert!((result.qty - 0.3).abs() < 1e-9);
        assert!((result.im_required - 1_500.0).abs() < 1e-6);
    }

    #[test]
    fn test_im_cap_limited_by_free_collateral_and_band_leverage() {
        let sizer = PositionSizer::default();
        let result = sizer.size_by_im_cap(10_000.0, 0.85, 100.0, 20, 50_000.0);
        assert_eq!(result.risk_band, RiskBand::Extreme);
        assert_eq!(result.leverage, 5);
        // min(200 band budget, 100 free) × 5 / 50000
        assert!((result.qty - 0.01).abs() < 1e-9);
        assert!(result.im_required <= 100.0 + 1e-9);
    }

    #[test]
    fn test_im_cap_invalid_price() {
        let sizer = PositionSizer::default();
        let result = sizer.size_by_im_cap(10_000.0, 0.1, 9_000.0, 10, 0.0);
        assert_eq!(result.qty, 0.0);
        assert_eq!(result.im_required, 0.0);
    }
}
