use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entities::decision::{Action, Stage};

/// Append-only trace of one provider opinion, or of the final verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAuditRecord {
    pub cycle_id: String,
    pub symbol: String,
    /// Provider name, or `consensus` for the FINAL row
    pub provider: String,
    pub stage: Stage,
    pub action: Option<Action>,
    pub confidence: Option<u8>,
    pub input_context: Value,
    pub raw_output: Value,
    pub latency_ms: Option<u64>,
    pub reason: String,
    pub policy_version: String,
    pub created_at: DateTime<Utc>,
}
