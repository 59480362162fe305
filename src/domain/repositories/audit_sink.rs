use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::entities::audit::DecisionAuditRecord;
use crate::domain::errors::AuditError;

/// Append-only destination for decision audit records
#[async_trait]
pub trait DecisionAuditSink: Send + Sync {
    async fn append(&self, records: &[DecisionAuditRecord]) -> Result<(), AuditError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<DecisionAuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DecisionAuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DecisionAuditSink for InMemoryAuditSink {
    async fn append(&self, records: &[DecisionAuditRecord]) -> Result<(), AuditError> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}
