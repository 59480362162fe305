//! HTTP transport for AI providers
//!
//! Posts `{symbol, stage, snapshot}` as JSON to the provider endpoint and
//! parses the reply at the ingestion boundary. Prompting and model choice
//! live behind the endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::domain::entities::decision::{ProviderDecision, Stage};
use crate::domain::entities::market::MarketSnapshot;
use crate::domain::errors::ProviderError;
use crate::domain::repositories::ai_provider::AiProvider;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    symbol: &'a str,
    stage: Stage,
    snapshot: &'a MarketSnapshot,
}

pub struct HttpAiProvider {
    config: HttpProviderConfig,
    client: Client,
}

impl HttpAiProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("consensus-trader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Transport {
                provider: config.name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    /// Accepts a bare decision object or one wrapped in `decision`
    pub fn parse_reply(provider: &str, stage: Stage, body: &Value) -> Result<ProviderDecision, ProviderError> {
        let payload = body.get("decision").unwrap_or(body);
        ProviderDecision::from_json(provider, stage, payload).map_err(|e| ProviderError::Malformed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })
    }

    fn transport(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Transport {
            provider: self.config.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn decide(
        &self,
        snapshot: &MarketSnapshot,
        stage: Stage,
        symbol: &str,
    ) -> Result<ProviderDecision, ProviderError> {
        let started = Instant::now();
        let mut request = self.client.post(&self.config.endpoint).json(&DecideRequest {
            symbol,
            stage,
            snapshot,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    provider: self.config.name.clone(),
                    after_ms: self.config.timeout.as_millis() as u64,
                }
            } else {
                self.transport(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport(format!("{} - {}", status, text)));
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Malformed {
            provider: self.config.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(
            provider = %self.config.name,
            symbol,
            stage = stage.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "provider replied"
        );
        Self::parse_reply(&self.config.name, stage, &body)
    }
}
