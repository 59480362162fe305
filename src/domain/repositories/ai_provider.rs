use async_trait::async_trait;

use crate::domain::entities::decision::{ProviderDecision, Stage};
use crate::domain::entities::market::MarketSnapshot;
use crate::domain::errors::ProviderError;

/// A source of independent trading opinions.
///
/// The consensus engine is agnostic over implementations: it only needs a
/// stable name, an on/off switch and a decision per round.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    async fn decide(
        &self,
        snapshot: &MarketSnapshot,
        stage: Stage,
        symbol: &str,
    ) -> Result<ProviderDecision, ProviderError>;
}
