//! Outbound alerting
//!
//! The core only describes what happened; channel adapters (chat, email,
//! webhook) and deduplication belong to implementations of this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warn => write!(f, "warn"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub code: String,
    pub message: String,
    pub context: Value,
    pub dedup_key: Option<String>,
}

impl Alert {
    pub fn new(level: AlertLevel, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            code: code.into(),
            message: message.into(),
            context: Value::Null,
            dedup_key: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    /// Deliver an alert. Failures are the dispatcher's to log; the core never
    /// lets an alert failure affect trading.
    async fn send(&self, alert: Alert);
}

/// Writes alerts to the tracing pipeline
#[derive(Debug, Default, Clone)]
pub struct TracingAlertDispatcher;

#[async_trait]
impl AlertDispatcher for TracingAlertDispatcher {
    async fn send(&self, alert: Alert) {
        let dedup = alert.dedup_key.as_deref().unwrap_or("-");
        match alert.level {
            AlertLevel::Info => info!(code = %alert.code, dedup, context = %alert.context, "{}", alert.message),
            AlertLevel::Warn => warn!(code = %alert.code, dedup, context = %alert.context, "{}", alert.message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(level = %alert.level, code = %alert.code, dedup, context = %alert.context, "{}", alert.message)
            }
        }
    }
}

/// Keeps every alert in memory; handy for inspection in tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingAlertDispatcher {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    pub async fn codes(&self) -> Vec<String> {
        self.alerts
            .lock()
            .await
            .iter()
            .map(|a| a.code.clone())
            .collect()
    }
}

#[async_trait]
impl AlertDispatcher for RecordingAlertDispatcher {
    async fn send(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
