//! Reconciliation Actor
//!
//! Owns the reconciliation service and serializes passes: a pass requested
//! while another runs waits in the mailbox instead of overlapping it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::domain::errors::ReconciliationError;
use crate::domain::services::reconciliation::{ReconciliationService, ReconciliationSummary};

/// Channel capacity for reconciliation actor messages
const RECONCILIATION_CHANNEL_CAPACITY: usize = 100;

/// Messages that can be sent to the reconciliation actor
#[derive(Debug)]
pub enum ReconciliationMessage {
    /// Run one full pass (external closes, then orphans)
    RunPass {
        reply: mpsc::Sender<Result<ReconciliationSummary, ReconciliationError>>,
    },

    GetStatus {
        reply: mpsc::Sender<ReconciliationStats>,
    },

    /// Shutdown the actor
    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationStats {
    pub total_passes: u64,
    pub successful_passes: u64,
    pub failed_passes: u64,
    pub last_pass: Option<DateTime<Utc>>,
    pub last_summary: Option<ReconciliationSummary>,
    pub last_error: Option<String>,
}

pub struct ReconciliationActor {
    service: Arc<ReconciliationService>,
    pass_timeout: Duration,
    stats: ReconciliationStats,
}

impl ReconciliationActor {
    pub fn new(service: Arc<ReconciliationService>, pass_timeout: Duration) -> Self {
        Self {
            service,
            pass_timeout,
            stats: ReconciliationStats::default(),
        }
    }

    /// Spawn a new reconciliation actor
    pub fn spawn(
        service: Arc<ReconciliationService>,
        pass_timeout: Duration,
    ) -> mpsc::Sender<ReconciliationMessage> {
        let (tx, rx) = mpsc::channel(RECONCILIATION_CHANNEL_CAPACITY);
        let actor = Self::new(service, pass_timeout);

        tokio::spawn(async move {
            actor.run(rx).await;
        });

        info!("ReconciliationActor spawned");
        tx
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<ReconciliationMessage>) {
        info!("ReconciliationActor started");

        while let Some(msg) = rx.recv().await {
            match msg {
                ReconciliationMessage::RunPass { reply } => {
                    debug!("ReconciliationActor received RunPass");
                    let result = self.run_pass().await;
                    self.update_stats(&result);
                    if let Err(e) = reply.send(result).await {
                        error!("Failed to send RunPass reply: {:?}", e);
                    }
                }

                ReconciliationMessage::GetStatus { reply } => {
                    if let Err(e) = reply.send(self.stats.clone()).await {
                        error!("Failed to send GetStatus reply: {:?}", e);
                    }
                }

                ReconciliationMessage::Shutdown => {
                    info!("ReconciliationActor received shutdown signal");
                    break;
                }
            }
        }

        info!("ReconciliationActor stopped");
    }

    async fn run_pass(&self) -> Result<ReconciliationSummary, ReconciliationError> {
        match timeout(self.pass_timeout, self.service.run_pass()).await {
            Ok(Ok(summary)) => {
                info!(
                    closed = summary.external_closes.closed.len(),
                    unresolved = summary.external_closes.unresolved.len(),
                    adopted = summary.orphans.adopted.len(),
                    duration_ms = summary.duration_ms,
                    "reconciliation pass completed"
                );
                Ok(summary)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "reconciliation pass failed, retrying next schedule");
                Err(e)
            }
            Err(_) => {
                warn!(timeout_ms = self.pass_timeout.as_millis() as u64, "reconciliation pass timed out");
                Err(ReconciliationError::Timeout)
            }
        }
    }

    fn update_stats(&mut self, result: &Result<ReconciliationSummary, ReconciliationError>) {
        self.stats.total_passes += 1;
        self.stats.last_pass = Some(Utc::now());

        match result {
            Ok(summary) => {
                self.stats.successful_passes += 1;
                self.stats.last_summary = Some(summary.clone());
                self.stats.last_error = None;
            }
            Err(e) => {
                self.stats.failed_passes += 1;
                self.stats.last_error = Some(e.to_string());
            }
        }
    }
}

/// Ask the actor for one pass and wait for the outcome
pub async fn request_pass(
    tx: &mpsc::Sender<ReconciliationMessage>,
) -> Result<ReconciliationSummary, ReconciliationError> {
    let (reply, mut rx) = mpsc::channel(1);
    let closed = || ReconciliationError::Store("reconciliation actor is not running".to_string());
    tx.send(ReconciliationMessage::RunPass { reply })
        .await
        .map_err(|_| closed())?;
    rx.recv().await.ok_or_else(closed)?
}
