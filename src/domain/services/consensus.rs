//! Consensus Engine
//!
//! Reduces a set of provider opinions to one vetted action. [`ConsensusEngine::decide`]
//! is a pure function of the snapshot and the decisions; collecting those
//! decisions from live providers is the async half of this module.
//!
//! Order of evaluation:
//! 1. quorum
//! 2. majority action (ties: weighted-median confidence, then conservative rank)
//! 3. NO_TRADE reliability
//! 4. confidence deviation among the winners
//! 5. range check, then level deviation, for actions that carry levels

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::entities::audit::DecisionAuditRecord;
use crate::domain::entities::decision::{Action, ProviderDecision, Stage};
use crate::domain::entities::market::MarketSnapshot;
use crate::domain::errors::ProviderError;
use crate::domain::policy::{ConsensusPolicy, POLICY_VERSION};
use crate::domain::repositories::ai_provider::AiProvider;
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerError};

/// Why a result was forced away from the majority action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VetoCode {
    InsufficientQuorum,
    NoTradeReliability,
    ConfidenceDeviation,
    OutOfRange,
    LevelDeviation,
}

impl VetoCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VetoCode::InsufficientQuorum => "insufficient_quorum",
            VetoCode::NoTradeReliability => "no_trade_reliability",
            VetoCode::ConfidenceDeviation => "confidence_deviation",
            VetoCode::OutOfRange => "out_of_range",
            VetoCode::LevelDeviation => "level_deviation",
        }
    }

    /// Machine-readable code for alerts and audit rows
    pub fn code(&self) -> &'static str {
        match self {
            VetoCode::InsufficientQuorum => "INSUFFICIENT_QUORUM",
            VetoCode::NoTradeReliability => "NO_TRADE_RELIABILITY",
            VetoCode::ConfidenceDeviation => "CONFIDENCE_DEVIATION",
            VetoCode::OutOfRange => "OUT_OF_RANGE",
            VetoCode::LevelDeviation => "LEVEL_DEVIATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VetoReason {
    pub code: VetoCode,
    pub message: String,
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Outcome of one consensus decision. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub cycle_id: String,
    pub symbol: String,
    pub action: Action,
    pub confidence: u8,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: Option<u32>,
    pub qty_delta_factor: f64,
    /// Majority action before safety rules were applied
    pub majority_action: Option<Action>,
    pub contributors: Vec<String>,
    pub veto: Option<VetoReason>,
    pub policy_version: String,
    /// SHA-256 of the canonical JSON of the inputs
    pub input_digest: String,
}

impl ConsensusResult {
    pub fn is_vetoed(&self) -> bool {
        self.veto.is_some()
    }

    /// Veto text, or an empty string when the majority stood
    pub fn reason(&self) -> String {
        self.veto.as_ref().map(|v| v.to_string()).unwrap_or_default()
    }
}

fn cmp_level(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Total order over every field that reaches the digest
fn canonical_order(a: &ProviderDecision, b: &ProviderDecision) -> Ordering {
    a.provider()
        .cmp(b.provider())
        .then(a.stage().as_str().cmp(b.stage().as_str()))
        .then(a.action().cmp(&b.action()))
        .then(a.confidence().cmp(&b.confidence()))
        .then(cmp_level(a.stop_loss(), b.stop_loss()))
        .then(cmp_level(a.take_profit(), b.take_profit()))
        .then(a.leverage().cmp(&b.leverage()))
        .then(a.qty_delta_factor().total_cmp(&b.qty_delta_factor()))
        .then(a.reason().cmp(b.reason()))
        .then_with(|| a.raw().to_string().cmp(&b.raw().to_string()))
}

/// Weighted median: the first value, in ascending order, at which the
/// cumulative weight reaches half the total. Equal weights are used when the
/// supplied weights do not sum to something positive.
pub fn weighted_median(values: &[(f64, f64)]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<(f64, f64)> = values.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|(_, w)| w.max(0.0)).sum();
    let equal = !(total > 0.0 && total.is_finite());
    let total = if equal { sorted.len() as f64 } else { total };

    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += if equal { 1.0 } else { weight.max(0.0) };
        if cumulative / total >= 0.5 {
            return Some(*value);
        }
    }
    sorted.last().map(|(v, _)| *v)
}

/// Plain median, averaging the middle pair
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    })
}

/// Mean after dropping the min and max when there are at least three values
pub fn trimmed_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let kept = if sorted.len() >= 3 {
        &sorted[1..sorted.len() - 1]
    } else {
        &sorted[..]
    };
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

#[derive(Serialize)]
struct DigestInput<'a> {
    policy_version: &'a str,
    policy: &'a ConsensusPolicy,
    weights: &'a BTreeMap<String, f64>,
    snapshot: &'a MarketSnapshot,
    decisions: &'a [ProviderDecision],
}

/// Decisions and failures from one polling round
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub decisions: Vec<ProviderDecision>,
    pub failures: Vec<ProviderError>,
    pub latencies_ms: BTreeMap<String, u64>,
}

/// A full R1 (+ optional R2) run
#[derive(Debug, Clone)]
pub struct ConsensusRun {
    pub r1: RoundOutcome,
    pub r2: Option<RoundOutcome>,
    /// Snapshot the final decision was taken on
    pub snapshot: MarketSnapshot,
    pub result: ConsensusResult,
}

pub struct ConsensusEngine {
    policy: ConsensusPolicy,
    policy_version: String,
    weights: BTreeMap<String, f64>,
    breaker: Option<CircuitBreaker>,
}

impl ConsensusEngine {
    pub fn new(policy: ConsensusPolicy) -> Self {
        Self {
            policy,
            policy_version: POLICY_VERSION.to_string(),
            weights: BTreeMap::new(),
            breaker: None,
        }
    }

    pub fn with_policy_version(mut self, version: impl Into<String>) -> Self {
        self.policy_version = version.into();
        self
    }

    /// Per-provider weight; providers without one weigh 1.0
    pub fn with_weight(mut self, provider: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(provider.into(), weight);
        self
    }

    /// Route provider calls through `breaker`, keyed `ai_provider:{name}`
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    fn weight(&self, provider: &str) -> f64 {
        self.weights.get(provider).copied().unwrap_or(1.0)
    }

    fn digest(&self, snapshot: &MarketSnapshot, decisions: &[ProviderDecision]) -> String {
        let input = DigestInput {
            policy_version: &self.policy_version,
            policy: &self.policy,
            weights: &self.weights,
            snapshot,
            decisions,
        };
        // serialization of these types cannot fail; an empty payload still hashes
        let canonical = serde_json::to_vec(&input).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    fn weighted_confidence(&self, voters: &[&ProviderDecision]) -> u8 {
        let pairs: Vec<(f64, f64)> = voters
            .iter()
            .map(|d| (f64::from(d.confidence()), self.weight(d.provider())))
            .collect();
        weighted_median(&pairs).map_or(0, |c| c.round().clamp(0.0, 100.0) as u8)
    }

    /// Pure reduction of `decisions` to one result
    ///
    /// Identical inputs always produce identical results, independent of the
    /// order in which decisions are supplied.
    pub fn decide(&self, snapshot: &MarketSnapshot, decisions: &[ProviderDecision]) -> ConsensusResult {
        let mut sorted: Vec<ProviderDecision> = decisions.to_vec();
        sorted.sort_by(canonical_order);

        let mut contributors: Vec<String> = sorted.iter().map(|d| d.provider().to_string()).collect();
        contributors.dedup();

        let base = ConsensusResult {
            cycle_id: snapshot.cycle_id.clone(),
            symbol: snapshot.symbol.clone(),
            action: Action::NoTrade,
            confidence: 0,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            qty_delta_factor: 0.0,
            majority_action: None,
            contributors,
            veto: None,
            policy_version: self.policy_version.clone(),
            input_digest: self.digest(snapshot, &sorted),
        };

        if sorted.is_empty() || sorted.len() < self.policy.quorum.max(1) {
            return ConsensusResult {
                veto: Some(VetoReason {
                    code: VetoCode::InsufficientQuorum,
                    message: format!(
                        "{} surviving providers, quorum {}",
                        sorted.len(),
                        self.policy.quorum.max(1)
                    ),
                }),
                ..base
            };
        }

        let majority = self.majority_action(&sorted);
        let winners: Vec<&ProviderDecision> =
            sorted.iter().filter(|d| d.action() == majority).collect();
        let confidence = self.weighted_confidence(&winners);
        let base = ConsensusResult {
            majority_action: Some(majority),
            ..base
        };

        // 1. a confident abstention overrides everything
        let no_trade_voters: Vec<&ProviderDecision> = sorted
            .iter()
            .filter(|d| {
                d.action() == Action::NoTrade
                    && d.confidence() >= self.policy.no_trade_veto_confidence
            })
            .collect();
        if !no_trade_voters.is_empty() {
            let strongest = no_trade_voters
                .iter()
                .map(|d| d.confidence())
                .max()
                .unwrap_or(self.policy.no_trade_veto_confidence);
            return ConsensusResult {
                action: Action::NoTrade,
                confidence: strongest,
                veto: Some(VetoReason {
                    code: VetoCode::NoTradeReliability,
                    message: format!(
                        "NO_TRADE at {} from {}",
                        strongest,
                        no_trade_voters
                            .iter()
                            .map(|d| d.provider())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                }),
                ..base
            };
        }

        // 2. the winners must roughly agree on how sure they are
        let max_conf = winners.iter().map(|d| d.confidence()).max().unwrap_or(0);
        let min_conf = winners.iter().map(|d| d.confidence()).min().unwrap_or(0);
        let spread = max_conf - min_conf;
        if spread > self.policy.deviation_threshold {
            return ConsensusResult {
                action: Action::Hold,
                confidence,
                veto: Some(VetoReason {
                    code: VetoCode::ConfidenceDeviation,
                    message: format!(
                        "{} voters span {} points ({}..{}), limit {}",
                        majority, spread, min_conf, max_conf, self.policy.deviation_threshold
                    ),
                }),
                ..base
            };
        }

        if matches!(majority, Action::Long | Action::Short | Action::Hold) {
            if let Some(veto) = self.range_veto(&winners).or_else(|| self.level_deviation_veto(&winners)) {
                return ConsensusResult {
                    action: Action::Hold,
                    confidence,
                    veto: Some(veto),
                    ..base
                };
            }
        }

        let stop_loss = trimmed_mean(&winners.iter().filter_map(|d| d.stop_loss()).collect::<Vec<_>>());
        let take_profit =
            trimmed_mean(&winners.iter().filter_map(|d| d.take_profit()).collect::<Vec<_>>());
        let leverages: Vec<f64> = winners
            .iter()
            .filter_map(|d| d.leverage())
            .map(f64::from)
            .collect();
        let leverage = (!leverages.is_empty()).then(|| {
            let mean = leverages.iter().sum::<f64>() / leverages.len() as f64;
            (mean.ceil() as u32).clamp(
                self.policy.consensus_min_leverage,
                self.policy.consensus_max_leverage,
            )
        });
        let factors: Vec<(f64, f64)> = winners
            .iter()
            .map(|d| (d.qty_delta_factor(), self.weight(d.provider())))
            .collect();

        ConsensusResult {
            action: majority,
            confidence,
            stop_loss,
            take_profit,
            leverage,
            qty_delta_factor: weighted_median(&factors).unwrap_or(0.0),
            ..base
        }
    }

    fn majority_action(&self, decisions: &[ProviderDecision]) -> Action {
        let mut votes: BTreeMap<Action, Vec<&ProviderDecision>> = BTreeMap::new();
        for d in decisions {
            votes.entry(d.action()).or_default().push(d);
        }
        let top = votes.values().map(Vec::len).max().unwrap_or(0);
        votes
            .iter()
            .filter(|(_, voters)| voters.len() == top)
            .map(|(action, voters)| (self.weighted_confidence(voters), *action))
            // ties on confidence fall to the later, more conservative action
            .max()
            .map_or(Action::NoTrade, |(_, action)| action)
    }

    fn range_veto(&self, winners: &[&ProviderDecision]) -> Option<VetoReason> {
        for d in winners {
            if let Some(lev) = d.leverage() {
                if lev < self.policy.min_leverage || lev > self.policy.max_leverage {
                    return Some(VetoReason {
                        code: VetoCode::OutOfRange,
                        message: format!(
                            "{} leverage {} outside {}..={}",
                            d.provider(),
                            lev,
                            self.policy.min_leverage,
                            self.policy.max_leverage
                        ),
                    });
                }
            }
            for (field, value) in [("stop_loss", d.stop_loss()), ("take_profit", d.take_profit())] {
                if let Some(v) = value {
                    if v <= 0.0 {
                        return Some(VetoReason {
                            code: VetoCode::OutOfRange,
                            message: format!("{} {} {} is not positive", d.provider(), field, v),
                        });
                    }
                }
            }
        }
        None
    }

    fn level_deviation_veto(&self, winners: &[&ProviderDecision]) -> Option<VetoReason> {
        let fields: [(&str, Vec<(&str, f64)>); 3] = [
            (
                "leverage",
                winners
                    .iter()
                    .filter_map(|d| d.leverage().map(|v| (d.provider(), f64::from(v))))
                    .collect(),
            ),
            (
                "stop_loss",
                winners
                    .iter()
                    .filter_map(|d| d.stop_loss().map(|v| (d.provider(), v)))
                    .collect(),
            ),
            (
                "take_profit",
                winners
                    .iter()
                    .filter_map(|d| d.take_profit().map(|v| (d.provider(), v)))
                    .collect(),
            ),
        ];

        for (field, values) in fields {
            if values.len() < 2 {
                continue;
            }
            let plain: Vec<f64> = values.iter().map(|(_, v)| *v).collect();
            let Some(mid) = median(&plain) else { continue };
            for (provider, value) in &values {
                let deviation = (value - mid).abs() / mid.abs().max(1e-8);
                if deviation > self.policy.level_deviation_threshold {
                    return Some(VetoReason {
                        code: VetoCode::LevelDeviation,
                        message: format!(
                            "{} {} {} deviates {:.1}% from median {}",
                            provider,
                            field,
                            value,
                            deviation * 100.0,
                            mid
                        ),
                    });
                }
            }
        }
        None
    }

    /// Poll every enabled provider concurrently for one round
    ///
    /// A provider that errors, times out or sits behind an open circuit is
    /// left out of the round; the round itself never fails.
    pub async fn collect_round(
        &self,
        providers: &[Arc<dyn AiProvider>],
        snapshot: &MarketSnapshot,
        stage: Stage,
    ) -> RoundOutcome {
        let timeout = self.policy.provider_timeout;
        let calls = providers.iter().filter(|p| p.enabled()).map(|provider| async move {
            let name = provider.name().to_string();
            let started = Instant::now();
            let call = async {
                match tokio::time::timeout(timeout, provider.decide(snapshot, stage, &snapshot.symbol))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: name.clone(),
                        after_ms: timeout.as_millis() as u64,
                    }),
                }
            };

            let result = match &self.breaker {
                None => call.await,
                Some(breaker) => breaker
                    .call(&format!("ai_provider:{}", name), || call)
                    .await
                    .map_err(|e| match e {
                        CircuitBreakerError::OperationFailed(inner) => inner,
                        CircuitBreakerError::CircuitOpen { .. } => ProviderError::CircuitOpen {
                            provider: name.clone(),
                        },
                        CircuitBreakerError::Timeout { after, .. } => ProviderError::Timeout {
                            provider: name.clone(),
                            after_ms: after.as_millis() as u64,
                        },
                        CircuitBreakerError::Store(kv) => ProviderError::Transport {
                            provider: name.clone(),
                            message: kv.to_string(),
                        },
                    }),
            };
            (name, started.elapsed().as_millis() as u64, result)
        });

        let mut outcome = RoundOutcome::default();
        for (name, latency_ms, result) in join_all(calls).await {
            outcome.latencies_ms.insert(name.clone(), latency_ms);
            match result {
                Ok(decision) => {
                    debug!(
                        provider = %name,
                        stage = %stage,
                        action = %decision.action(),
                        confidence = decision.confidence(),
                        latency_ms,
                        "provider decided"
                    );
                    outcome.decisions.push(decision);
                }
                Err(e) => {
                    warn!(
                        provider = %name,
                        stage = %stage,
                        code = e.code(),
                        error = %e,
                        latency_ms,
                        "provider excluded from quorum"
                    );
                    outcome.failures.push(e);
                }
            }
        }
        outcome
    }

    /// R1, then optionally R2 fed with the compacted R1 opinions
    ///
    /// If nobody answers R2 the decision falls back to R1.
    pub async fn run(
        &self,
        providers: &[Arc<dyn AiProvider>],
        snapshot: &MarketSnapshot,
        two_round: bool,
    ) -> ConsensusRun {
        let r1 = self.collect_round(providers, snapshot, Stage::R1).await;

        let (r2, decided_on, decisions) = if two_round && !r1.decisions.is_empty() {
            let summary = r1.decisions.iter().map(ProviderDecision::summary).collect();
            let r2_snapshot = snapshot.with_round_summary(summary);
            let r2 = self.collect_round(providers, &r2_snapshot, Stage::R2).await;
            if r2.decisions.is_empty() {
                warn!(symbol = %snapshot.symbol, "no second-round answers, deciding on R1");
                let decisions = r1.decisions.clone();
                (Some(r2), snapshot.clone(), decisions)
            } else {
                let decisions = r2.decisions.clone();
                (Some(r2), r2_snapshot, decisions)
            }
        } else {
            (None, snapshot.clone(), r1.decisions.clone())
        };

        let result = self.decide(&decided_on, &decisions);
        info!(
            symbol = %result.symbol,
            cycle_id = %result.cycle_id,
            action = %result.action,
            confidence = result.confidence,
            veto = result.veto.as_ref().map(|v| v.code.code()).unwrap_or("-"),
            providers = result.contributors.len(),
            policy_version = %result.policy_version,
            "consensus decided"
        );

        ConsensusRun {
            r1,
            r2,
            snapshot: decided_on,
            result,
        }
    }

    /// One row per provider answer or failure, plus the FINAL row
    pub fn audit_records(&self, run: &ConsensusRun, at: DateTime<Utc>) -> Vec<DecisionAuditRecord> {
        let context = serde_json::to_value(&run.snapshot).unwrap_or(Value::Null);
        let mut records = Vec::new();

        let rounds = std::iter::once((Stage::R1, &run.r1)).chain(run.r2.iter().map(|r| (Stage::R2, r)));
        for (stage, round) in rounds {
            for d in &round.decisions {
                records.push(DecisionAuditRecord {
                    cycle_id: run.result.cycle_id.clone(),
                    symbol: run.result.symbol.clone(),
                    provider: d.provider().to_string(),
                    stage,
                    action: Some(d.action()),
                    confidence: Some(d.confidence()),
                    input_context: context.clone(),
                    raw_output: d.raw().clone(),
                    latency_ms: round.latencies_ms.get(d.provider()).copied(),
                    reason: d.reason().to_string(),
                    policy_version: self.policy_version.clone(),
                    created_at: at,
                });
            }
            for e in &round.failures {
                records.push(DecisionAuditRecord {
                    cycle_id: run.result.cycle_id.clone(),
                    symbol: run.result.symbol.clone(),
                    provider: e.provider().to_string(),
                    stage,
                    action: None,
                    confidence: None,
                    input_context: context.clone(),
                    raw_output: json!({ "error": e.code(), "message": e.to_string() }),
                    latency_ms: round.latencies_ms.get(e.provider()).copied(),
                    reason: e.code().to_string(),
                    policy_version: self.policy_version.clone(),
                    created_at: at,
                });
            }
        }

        records.push(DecisionAuditRecord {
            cycle_id: run.result.cycle_id.clone(),
            symbol: run.result.symbol.clone(),
            provider: "consensus".to_string(),
            stage: Stage::Final,
            action: Some(run.result.action),
            confidence: Some(run.result.confidence),
            input_context: context,
            raw_output: serde_json::to_value(&run.result).unwrap_or(Value::Null),
            latency_ms: None,
            reason: run.result.reason(),
            policy_version: self.policy_version.clone(),
            created_at: at,
        });
        records
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(ConsensusPolicy::default())
    }
}
