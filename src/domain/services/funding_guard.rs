//! Funding Guard
//!
//! Blocks new positions in the minutes before a funding settlement when the
//! rate is large enough to matter. Also offers softer advice on entry timing
//! and size for callers that want it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::market::FundingInfo;
use crate::domain::policy::RiskPolicy;

pub const FUNDING_WINDOW_BLOCK: &str = "FUNDING_WINDOW_BLOCK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingCheck {
    pub ok: bool,
    pub reason: Option<String>,
    /// Minutes until the next settlement; `None` without funding data
    pub minutes_to_funding: Option<f64>,
    pub funding_bps: Option<f64>,
    pub message: String,
}

impl FundingCheck {
    fn pass(message: &str) -> Self {
        Self {
            ok: true,
            reason: None,
            minutes_to_funding: None,
            funding_bps: None,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FundingGuard {
    window_minutes: i64,
    limit_bps: f64,
}

impl FundingGuard {
    pub fn new(window_minutes: i64, limit_bps: f64) -> Self {
        Self {
            window_minutes,
            limit_bps,
        }
    }

    pub fn from_policy(policy: &RiskPolicy) -> Self {
        Self::new(policy.funding_window_minutes, policy.funding_limit_bps)
    }

    fn minutes_until(funding: &FundingInfo, now: DateTime<Utc>) -> f64 {
        (funding.next_funding_time - now).num_milliseconds() as f64 / 60_000.0
    }

    pub fn ok_to_open(&self, funding: Option<&FundingInfo>, now: DateTime<Utc>) -> FundingCheck {
        if self.window_minutes <= 0 || self.limit_bps <= 0.0 {
            return FundingCheck::pass("funding guard disabled");
        }
        let Some(funding) = funding.filter(|f| f.rate.is_finite()) else {
            return FundingCheck::pass("no funding data available");
        };

        let minutes_left = Self::minutes_until(funding, now).abs();
        let funding_bps = funding.rate.abs() * 10_000.0;
        let blocked = minutes_left <= self.window_minutes as f64 && funding_bps > self.limit_bps;

        FundingCheck {
            ok: !blocked,
            reason: blocked.then(|| FUNDING_WINDOW_BLOCK.to_string()),
            minutes_to_funding: Some(minutes_left),
            funding_bps: Some(funding_bps),
            message: if blocked {
                format!(
                    "funding {:.2} bps settles in {:.1} min (limit {} bps within {} min)",
                    funding_bps, minutes_left, self.limit_bps, self.window_minutes
                )
            } else {
                "funding window clear".to_string()
            },
        }
    }

    /// True more than 30 minutes before or more than 15 minutes after settlement
    pub fn optimal_entry_timing(funding: Option<&FundingInfo>, now: DateTime<Utc>) -> bool {
        match funding {
            None => true,
            Some(f) => {
                let minutes = Self::minutes_until(f, now);
                minutes > 30.0 || minutes < -15.0
            }
        }
    }

    /// Multiplier applied to a base quantity near settlement
    pub fn size_adjustment_factor(funding: Option<&FundingInfo>, now: DateTime<Utc>) -> f64 {
        let Some(f) = funding else {
            return 1.0;
        };
        let mut factor = 1.0;
        let minutes = Self::minutes_until(f, now);
        if minutes > 0.0 && minutes <= 30.0 {
            factor = 0.7;
        }
        if f.rate.abs() > 0.001 {
            factor *= 0.8;
        }
        factor
    }
}

impl Default for FundingGuard {
    fn default() -> Self {
        Self::from_policy(&RiskPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn funding(rate: f64, minutes_ahead: i64, now: DateTime<Utc>) -> FundingInfo {
        FundingInfo {
            rate,
            next_funding_time: now + Duration::minutes(minutes_ahead),
        }
    }

    #[test]
    fn test_blocks_high_rate_inside_window() {
        let now = Utc::now();
        let guard = FundingGuard::default();
        let check = guard.ok_to_open(Some(&funding(0.004, 3, now)), now);
        assert!(!check.ok);
        assert_eq!(check.reason.as_deref(), Some(FUNDING_WINDOW_BLOCK));
        assert!((check.funding_bps.unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_passes_outside_window_or_below_limit() {
        let now = Utc::now();
        let guard = FundingGuard::default();
        assert!(guard.ok_to_open(Some(&funding(0.004, 20, now)), now).ok);
        assert!(guard.ok_to_open(Some(&funding(0.0001, 2, now)), now).ok);
        assert!(guard.ok_to_open(Some(&funding(-0.004, 60, now)), now).ok);
    }

    #[test]
    fn test_negative_rate_counts_by_magnitude() {
        let now = Utc::now();
        let check = FundingGuard::default().ok_to_open(Some(&funding(-0.005, 1, now)), now);
        assert!(!check.ok);
    }

    #[test]
    fn test_missing_data_or_disabled_passes() {
        let now = Utc::now();
        assert!(FundingGuard::default().ok_to_open(None, now).ok);
        let disabled = FundingGuard::new(0, 30.0);
        assert!(disabled.ok_to_open(Some(&funding(0.01, 1, now)), now).ok);
        let disabled = FundingGuard::new(5, 0.0);
        assert!(disabled.ok_to_open(Some(&funding(0.01, 1, now)), now).ok);
    }

    #[test]
    fn test_entry_timing_and_size_factor() {
        let now = Utc::now();
        assert!(FundingGuard::optimal_entry_timing(Some(&funding(0.0, 45, now)), now));
        assert!(!FundingGuard::optimal_entry_timing(Some(&funding(0.0, 10, now)), now));
        assert!(!FundingGuard::optimal_entry_timing(Some(&funding(0.0, -5, now)), now));
        assert!(FundingGuard::optimal_entry_timing(Some(&funding(0.0, -20, now)), now));

        let f = FundingGuard::size_adjustment_factor(Some(&funding(0.0001, 10, now)), now);
        assert!((f - 0.7).abs() < 1e-9);
        let f = FundingGuard::size_adjustment_factor(Some(&funding(0.002, 10, now)), now);
        assert!((f - 0.56).abs() < 1e-9);
        let f = FundingGuard::size_adjustment_factor(Some(&funding(0.002, 90, now)), now);
        assert!((f - 0.8).abs() < 1e-9);
        assert_eq!(FundingGuard::size_adjustment_factor(None, now), 1.0);
    }
}
