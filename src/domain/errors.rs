use thiserror::Error;

use crate::domain::entities::order::OrderMode;
use crate::domain::entities::trade::TradeStatus;
use crate::domain::repositories::exchange_client::ExchangeError;

/// Raised when a value object or entity is constructed with out-of-range input
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Confidence must be within 0..=100, got {0}")]
    ConfidenceOutOfRange(i64),

    #[error("qtyDeltaFactor must be within -1..=1, got {0}")]
    QtyDeltaFactorOutOfRange(f64),

    #[error("Value for {0} must be finite")]
    MustBeFinite(String),

    #[error("Value for {field} must be positive, got {value}")]
    MustBePositive { field: String, value: f64 },

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error(
        "Protective levels out of order for {side}: stop_loss={stop_loss:?} entry={entry} take_profit={take_profit:?}"
    )]
    StopOrdering {
        side: String,
        stop_loss: Option<f64>,
        entry: f64,
        take_profit: Option<f64>,
    },
}

/// Provider failures never abort a cycle; the provider is excluded from quorum
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider {provider} timed out after {after_ms}ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("Provider {provider} returned a malformed decision: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("Provider {provider} transport failure: {message}")]
    Transport { provider: String, message: String },

    #[error("Provider {provider} is behind an open circuit")]
    CircuitOpen { provider: String },
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            ProviderError::Timeout { provider, .. }
            | ProviderError::Malformed { provider, .. }
            | ProviderError::Transport { provider, .. }
            | ProviderError::CircuitOpen { provider } => provider,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "PROVIDER_TIMEOUT",
            ProviderError::Malformed { .. } => "PROVIDER_MALFORMED",
            ProviderError::Transport { .. } => "PROVIDER_TRANSPORT",
            ProviderError::CircuitOpen { .. } => "PROVIDER_CIRCUIT_OPEN",
        }
    }
}

/// One rejected ladder rung; the ladder moves on to the next rung
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("{mode} rejected by exchange: {source}")]
    Rejected {
        mode: OrderMode,
        #[source]
        source: ExchangeError,
    },

    #[error("{mode} not attempted: circuit for {service} is open")]
    CircuitOpen { mode: OrderMode, service: String },

    #[error("{mode} timed out")]
    Timeout { mode: OrderMode },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconciliationError {
    #[error("Exchange query failed during {step}: {message}")]
    Exchange { step: String, message: String },

    #[error("Trade store failure: {0}")]
    Store(String),

    #[error("Reconciliation pass timed out")]
    Timeout,
}

impl From<StoreError> for ReconciliationError {
    fn from(e: StoreError) -> Self {
        ReconciliationError::Store(e.to_string())
    }
}

/// Failures of the shared key-value store
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KvError {
    #[error("Key-value backend error: {0}")]
    Backend(String),

    #[error("Corrupt value under {key}: {value}")]
    Corrupt { key: String, value: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Trade store backend error: {0}")]
    Backend(String),

    #[error("Trade not found: {0}")]
    NotFound(String),

    #[error("Trade {0} is no longer open")]
    NotOpen(String),

    #[error("Corrupt trade row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TradeTransitionError {
    #[error("Trade {id} is {status} and cannot transition")]
    NotOpen { id: String, status: TradeStatus },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit backend error: {0}")]
    Backend(String),
}
