use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::entities::market::RiskParams;
use crate::domain::policy::SafetyPolicy;
use crate::infrastructure::http_provider::HttpProviderConfig;
use crate::infrastructure::rate_limit::RateLimiterConfig;
use crate::persistence::DatabaseConfig;

/// Runtime configuration for the trading daemon
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Symbols traded by the cycle scheduler (uppercase, e.g. BTCUSDT)
    pub symbols: Vec<String>,
    pub cycle_interval_seconds: u64,
    /// Kline interval in venue notation, minutes or D/W (e.g. "15")
    pub kline_interval: String,
    pub risk: RiskParams,
    /// Starting equity of the paper venue
    pub paper_equity: f64,

    pub providers: Vec<HttpProviderConfig>,

    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub database: DatabaseConfig,
    pub rate_limit: RateLimiterConfig,

    // Reconciliation scheduling
    pub reconciliation_enabled: bool,
    pub reconciliation_interval_seconds: u64,
    pub reconciliation_timeout_milliseconds: u64,

    pub policy: SafetyPolicy,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            cycle_interval_seconds: 300, // one decision per 5m per symbol
            kline_interval: "15".to_string(),
            risk: RiskParams {
                leverage: 5,
                risk_per_trade: 0.01,
                fee_rate: 0.0006,
                slippage_rate: 0.0005,
            },
            paper_equity: 10_000.0,

            providers: Vec::new(),

            redis_url: None,
            redis_prefix: "consensus_trader".to_string(),
            database: DatabaseConfig::default(),
            rate_limit: RateLimiterConfig::default(),

            reconciliation_enabled: true,
            reconciliation_interval_seconds: 300,
            reconciliation_timeout_milliseconds: 10_000,

            policy: SafetyPolicy::default(),
        }
    }
}

/// Parse `name` and keep it only when `valid` accepts it
fn env_value<T>(name: &str, valid: impl Fn(&T) -> bool) -> Option<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(value) => {
            tracing::warn!("Invalid {} value: {} (out of range), using default", name, value);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default", name, raw, e);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

impl TradingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> TradingConfig {
        let mut config = TradingConfig::default();

        if let Ok(raw) = std::env::var("TRADING_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(Self::normalize_symbol)
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                tracing::warn!("TRADING_SYMBOLS is empty, using default: {:?}", config.symbols);
            } else {
                config.symbols = symbols;
            }
        }

        if let Some(value) = env_value("CYCLE_INTERVAL_SECONDS", |v: &u64| (10..=86_400).contains(v)) {
            config.cycle_interval_seconds = value;
        }

        if let Ok(interval) = std::env::var("KLINE_INTERVAL") {
            if ["1", "3", "5", "15", "30", "60", "240", "D", "W"].contains(&interval.as_str()) {
                config.kline_interval = interval;
            } else {
                tracing::warn!("Unsupported KLINE_INTERVAL '{}', using default: {}", interval, config.kline_interval);
            }
        }

        if let Some(value) = env_value("DEFAULT_LEVERAGE", |v: &u32| (1..=125).contains(v)) {
            config.risk.leverage = value;
        }

        if let Some(value) = env_value("RISK_PER_TRADE", |v: &f64| *v > 0.0 && *v <= 0.05) {
            config.risk.risk_per_trade = value;
        }

        if let Some(value) = env_value("FEE_RATE", |v: &f64| (0.0..0.01).contains(v)) {
            config.risk.fee_rate = value;
        }

        if let Some(value) = env_value("SLIPPAGE_RATE", |v: &f64| (0.0..0.05).contains(v)) {
            config.risk.slippage_rate = value;
        }

        if let Some(value) = env_value("PAPER_EQUITY", |v: &f64| *v > 0.0) {
            config.paper_equity = value;
        }

        if let Ok(raw) = std::env::var("AI_PROVIDERS") {
            config.providers = Self::parse_providers(&raw, config.policy.consensus.provider_timeout);
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                config.redis_url = Some(url);
            }
        }

        if let Ok(prefix) = std::env::var("REDIS_PREFIX") {
            config.redis_prefix = prefix;
        }

        config.database = DatabaseConfig::from_env();

        if let Some(value) = env_value("EXCHANGE_REQUESTS_PER_SECOND", |v: &u32| (1..=100).contains(v)) {
            config.rate_limit.requests_per_second = value;
        }

        // Reconciliation
        if let Some(enabled) = env_flag("RECONCILIATION_ENABLED") {
            config.reconciliation_enabled = enabled;
        }

        if let Some(value) = env_value("RECONCILIATION_INTERVAL_SECONDS", |v: &u64| (60..=3600).contains(v)) {
            config.reconciliation_interval_seconds = value;
        }

        if let Some(value) = env_value("RECONCILIATION_TIMEOUT_MILLISECONDS", |v: &u64| {
            (1000..=60_000).contains(v)
        }) {
            config.reconciliation_timeout_milliseconds = value;
        }

        // Safety policy overrides
        if let Some(value) = env_value("CONSENSUS_QUORUM", |v: &usize| *v >= 1) {
            config.policy.consensus.quorum = value;
        }

        if let Some(value) = env_value("CONSENSUS_VETO_LIMIT", |v: &u32| (1..=100).contains(v)) {
            config.policy.consensus.veto_limit = value;
        }

        if let Some(value) = env_value("LIQUIDATION_SAFETY_FACTOR", |v: &f64| *v > 0.0 && *v <= 5.0) {
            config.policy.risk.liquidation_safety_factor = value;
        }

        if let Some(value) = env_value("SLIPPAGE_CAP_BPS", |v: &u32| (1..=500).contains(v)) {
            config.policy.execution.slippage_cap_bps = value;
        }

        config
    }

    /// `AI_PROVIDERS` is a comma separated list of `name=endpoint`. The API
    /// key of a provider is read from `AI_PROVIDER_<NAME>_API_KEY`.
    pub fn parse_providers(raw: &str, timeout: Duration) -> Vec<HttpProviderConfig> {
        raw.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                if entry.is_empty() {
                    return None;
                }
                match entry.split_once('=') {
                    Some((name, endpoint)) if !name.trim().is_empty() && endpoint.starts_with("http") => {
                        let name = name.trim().to_lowercase();
                        let key_var = format!("AI_PROVIDER_{}_API_KEY", name.to_uppercase());
                        Some(HttpProviderConfig {
                            api_key: std::env::var(key_var).ok(),
                            name,
                            endpoint: endpoint.trim().to_string(),
                            enabled: true,
                            timeout,
                        })
                    }
                    _ => {
                        tracing::warn!("Ignoring malformed AI_PROVIDERS entry '{}'", entry);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_seconds)
    }

    pub fn reconciliation_timeout(&self) -> Duration {
        Duration::from_millis(self.reconciliation_timeout_milliseconds)
    }

    /// Normalize symbol to the venue format (BTCUSDT)
    pub fn normalize_symbol(symbol: &str) -> String {
        let upper = symbol.trim().to_uppercase();
        let compact: String = upper.chars().filter(|c| !matches!(c, '-' | '/' | '_')).collect();

        if compact.is_empty() || compact.ends_with("USDT") {
            compact
        } else if let Some(base) = compact.strip_suffix("USD") {
            format!("{}USDT", base)
        } else {
            format!("{}USDT", compact)
        }
    }
}
