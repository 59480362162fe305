//! ATR-scaled stop-loss and take-profit pricing

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::entities::market::Side;
use crate::domain::entities::trade::validate_levels;
use crate::domain::errors::ValidationError;
use crate::domain::policy::StopPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
    /// ATR actually used, after the fallback
    pub atr: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StopCalculator {
    policy: StopPolicy,
}

impl StopCalculator {
    pub fn new(policy: StopPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    fn effective_atr(&self, price: f64, atr: Option<f64>) -> f64 {
        atr.filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(price * self.policy.fallback_volatility)
    }

    /// Stop and target for an entry at `price`
    ///
    /// The stop sits `atr_multiplier × ATR` away, bounded to
    /// `[sl_min_pct, sl_max_pct]` of price. The target sits `reward_ratio`
    /// times further, bounded to `[tp_min_pct, tp_max_pct]`.
    pub fn compute(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        atr: Option<f64>,
        atr_multiplier: Option<f64>,
    ) -> Result<StopLevels, ValidationError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(ValidationError::MustBePositive {
                field: "price".to_string(),
                value: price,
            });
        }
        let multiplier = atr_multiplier
            .filter(|m| m.is_finite() && *m > 0.0)
            .unwrap_or(self.policy.atr_multiplier);
        let atr = self.effective_atr(price, atr);

        let sl_distance = (multiplier * atr).clamp(
            self.policy.sl_min_pct * price,
            self.policy.sl_max_pct * price,
        );
        let tp_distance = (self.policy.reward_ratio * sl_distance).clamp(
            self.policy.tp_min_pct * price,
            self.policy.tp_max_pct * price,
        );

        let (stop_loss, take_profit) = match side {
            Side::Long => (price - sl_distance, price + tp_distance),
            Side::Short => (price + sl_distance, price - tp_distance),
        };
        validate_levels(side, price, Some(stop_loss), Some(take_profit))?;

        debug!(
            symbol,
            side = %side,
            price,
            atr,
            stop_loss,
            take_profit,
            "computed protective levels"
        );
        Ok(StopLevels {
            stop_loss,
            take_profit,
            atr,
        })
    }

    /// Limit price for a stop-limit exit, 10% of ATR beyond the trigger
    pub fn stop_limit_price(&self, side: Side, trigger: f64, atr: Option<f64>) -> f64 {
        let offset = 0.1 * self.effective_atr(trigger, atr);
        match side {
            // a long's stop sells, so the limit sits below the trigger
            Side::Long => (trigger - offset).max(0.0),
            Side::Short => trigger + offset,
        }
    }
}
