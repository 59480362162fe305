//! Feed gap detection
//!
//! Tracks the last-seen timestamp per symbol and flags a backfill once the
//! feed has been silent longer than the threshold. The backfill range starts
//! a short pre-roll before the last seen point so the boundary bar is
//! fetched again.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::domain::policy::ReconciliationPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct GapReport {
    pub symbol: String,
    pub gap_seconds: f64,
    pub backfill_from: DateTime<Utc>,
    pub backfill_to: DateTime<Utc>,
}

pub struct GapDetector {
    threshold: Duration,
    preroll: Duration,
    watermarks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::from_policy(&ReconciliationPolicy::default())
    }
}

impl GapDetector {
    pub fn new(threshold: Duration, preroll: Duration) -> Self {
        Self {
            threshold,
            preroll,
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_policy(policy: &ReconciliationPolicy) -> Self {
        Self::new(policy.gap_threshold, policy.gap_preroll)
    }

    pub fn should_trigger_backfill(&self, gap_seconds: f64) -> bool {
        gap_seconds > self.threshold.as_secs_f64()
    }

    /// Compare a last-seen timestamp against `now`
    pub fn detect(
        &self,
        symbol: &str,
        last_seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<GapReport> {
        let gap_seconds = (now - last_seen).num_milliseconds() as f64 / 1000.0;
        if !self.should_trigger_backfill(gap_seconds) {
            return None;
        }
        let preroll = chrono::Duration::from_std(self.preroll).unwrap_or_else(|_| chrono::Duration::zero());
        Some(GapReport {
            symbol: symbol.to_string(),
            gap_seconds,
            backfill_from: last_seen - preroll,
            backfill_to: now,
        })
    }

    /// Advance the watermark; out-of-order timestamps never move it back
    pub async fn observe(&self, symbol: &str, ts: DateTime<Utc>) {
        let mut marks = self.watermarks.lock().await;
        let mark = marks.entry(symbol.to_string()).or_insert(ts);
        if ts > *mark {
            *mark = ts;
        }
    }

    pub async fn last_seen(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.watermarks.lock().await.get(symbol).copied()
    }

    /// Symbols never observed have no gap
    pub async fn check_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Option<GapReport> {
        let last_seen = self.last_seen(symbol).await?;
        let report = self.detect(symbol, last_seen, now);
        if let Some(r) = &report {
            warn!(
                symbol,
                gap_seconds = r.gap_seconds,
                from = %r.backfill_from,
                to = %r.backfill_to,
                "feed gap detected, backfill required"
            );
        }
        report
    }

    pub async fn check_all(&self, now: DateTime<Utc>) -> Vec<GapReport> {
        let marks: Vec<(String, DateTime<Utc>)> = self
            .watermarks
            .lock()
            .await
            .iter()
            .map(|(s, t)| (s.clone(), *t))
            .collect();
        let mut reports: Vec<GapReport> = marks
            .into_iter()
            .filter_map(|(symbol, last)| self.detect(&symbol, last, now))
            .collect();
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        reports
    }
}
