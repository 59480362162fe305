//! Correlation Service
//!
//! Pearson correlation and beta over log returns of recent klines. Return
//! series are cached briefly so one gate evaluation over N symbols costs N
//! kline requests at most.

use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::entities::market::Kline;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};

const CACHE_CAPACITY: usize = 64;
const DEFAULT_FRESHNESS: Duration = Duration::from_secs(60);
const MIN_BETA_RETURNS: usize = 10;

/// ln(close_t / close_{t-1}) for bars sorted by open time
pub fn log_returns(bars: &[Kline]) -> Vec<f64> {
    let mut sorted: Vec<&Kline> = bars.iter().collect();
    sorted.sort_by_key(|k| k.open_time);
    sorted
        .windows(2)
        .filter(|w| w[0].close > 0.0 && w[1].close > 0.0)
        .map(|w| (w[1].close / w[0].close).ln())
        .filter(|r| r.is_finite())
        .collect()
}

fn common_tail<'a>(a: &'a [f64], b: &'a [f64]) -> (&'a [f64], &'a [f64]) {
    let n = a.len().min(b.len());
    (&a[a.len() - n..], &b[b.len() - n..])
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// True when a sum of squared deviations is rounding noise relative to the
/// series' own magnitude, as for a constant series whose mean is inexact
fn spread_is_negligible(xs: &[f64], squared_deviations: f64) -> bool {
    let magnitude: f64 = xs.iter().map(|x| x * x).sum();
    !squared_deviations.is_finite()
        || squared_deviations <= f64::EPSILON * xs.len() as f64 * magnitude
}

/// Pearson correlation over the common tail; 0 when undefined
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let (a, b) = common_tail(a, b);
    if a.len() < 3 {
        return 0.0;
    }
    let (ma, mb) = (mean(a), mean(b));
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        cov += dx * dy;
        va += dx * dx;
        vb += dy * dy;
    }
    if spread_is_negligible(a, va) || spread_is_negligible(b, vb) {
        return 0.0;
    }
    let rho = cov / (va.sqrt() * vb.sqrt());
    if rho.is_finite() {
        rho.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Sample cov(asset, benchmark) / var(benchmark); 1.0 when undefined
pub fn beta_of(asset: &[f64], benchmark: &[f64]) -> f64 {
    if asset.len() < MIN_BETA_RETURNS || benchmark.len() < MIN_BETA_RETURNS {
        return 1.0;
    }
    let (a, b) = common_tail(asset, benchmark);
    let n = a.len() as f64;
    let (ma, mb) = (mean(a), mean(b));
    let cov = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum::<f64>() / (n - 1.0);
    let spread = b.iter().map(|y| (y - mb).powi(2)).sum::<f64>();
    if spread_is_negligible(b, spread) {
        return 1.0;
    }
    let var = spread / (n - 1.0);
    let beta = cov / var;
    if beta.is_finite() {
        beta
    } else {
        1.0
    }
}

/// Symmetric correlation matrix with a unit diagonal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationMatrix {
    cells: BTreeMap<String, BTreeMap<String, f64>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        self.cells.get(a).and_then(|row| row.get(b)).copied()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.cells.keys()
    }

    /// Strongest |ρ| between `candidate` and any of `others`
    pub fn max_abs_against(&self, candidate: &str, others: &[String]) -> Option<(String, f64)> {
        others
            .iter()
            .filter(|s| s.as_str() != candidate)
            .filter_map(|s| self.get(s, candidate).map(|rho| (s.clone(), rho.abs())))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

pub struct CorrelationService {
    exchange: Arc<dyn ExchangeClient>,
    bars: usize,
    interval: String,
    freshness: Duration,
    cache: Mutex<LruCache<String, (Instant, Vec<f64>)>>,
}

impl CorrelationService {
    pub fn new(exchange: Arc<dyn ExchangeClient>, bars: usize, interval: impl Into<String>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            exchange,
            bars,
            interval: interval.into(),
            freshness: DEFAULT_FRESHNESS,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Log returns for `symbol`, from cache while fresh
    pub async fn returns(&self, symbol: &str) -> ExchangeResult<Vec<f64>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some((fetched_at, series)) = cache.get(symbol) {
                if fetched_at.elapsed() < self.freshness {
                    return Ok(series.clone());
                }
            }
        }

        let bars = self
            .exchange
            .kline(symbol, &self.interval, self.bars + 1)
            .await?;
        let series = log_returns(&bars);
        debug!(symbol, returns = series.len(), "fetched return series");

        self.cache
            .lock()
            .await
            .put(symbol.to_string(), (Instant::now(), series.clone()));
        Ok(series)
    }

    pub async fn matrix(&self, symbols: &[String]) -> ExchangeResult<CorrelationMatrix> {
        let mut unique: Vec<String> = symbols.to_vec();
        unique.sort();
        unique.dedup();

        let mut series = BTreeMap::new();
        for symbol in &unique {
            series.insert(symbol.clone(), self.returns(symbol).await?);
        }

        let mut cells: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (i, a) in unique.iter().enumerate() {
            cells.entry(a.clone()).or_default().insert(a.clone(), 1.0);
            for b in &unique[i + 1..] {
                let rho = pearson(&series[a], &series[b]);
                cells.entry(a.clone()).or_default().insert(b.clone(), rho);
                cells.entry(b.clone()).or_default().insert(a.clone(), rho);
            }
        }
        Ok(CorrelationMatrix { cells })
    }

    pub async fn beta(&self, symbol: &str, benchmark: &str) -> ExchangeResult<f64> {
        if symbol == benchmark {
            return Ok(1.0);
        }
        let asset = self.returns(symbol).await?;
        let bench = self.returns(benchmark).await?;
        Ok(beta_of(&asset, &bench))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use chrono::{Duration as ChronoDuration, Utc};

    fn bars(closes: &[f64]) -> Vec<Kline> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Kline {
                open_time: start + ChronoDuration::minutes(5 * i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1.0,
            })
            .collect()
    }

    fn wave(n: usize, amp: f64, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 * (1.0 + amp * ((i as f64) * 0.7 + phase).sin()))
            .collect()
    }

    #[test]
    fn test_log_returns_sort_by_time() {
        let mut b = bars(&[100.0, 110.0, 99.0]);
        b.reverse();
        let r = log_returns(&b);
        assert_eq!(r.len(), 2);
        assert!((r[0] - (1.1f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_edge_cases() {
        assert_eq!(pearson(&[0.1, 0.2], &[0.1, 0.2]), 0.0);
        assert_eq!(pearson(&[0.1, 0.1, 0.1], &[0.3, 0.1, 0.2]), 0.0);
        let x = [0.01, -0.02, 0.03, 0.005, -0.01];
        assert!((pearson(&x, &x) - 1.0).abs() < 1e-12);
        let neg: Vec<f64> = x.iter().map(|v| -v).collect();
        assert!((pearson(&x, &neg) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_series_with_inexact_mean() {
        let flat = [0.1; 30];
        let moving: Vec<f64> = (0..30).map(|i| ((i as f64) * 0.4).cos() * 0.02).collect();
        assert_eq!(pearson(&flat, &moving), 0.0);
        assert_eq!(pearson(&moving, &[0.3; 30]), 0.0);
        assert_eq!(beta_of(&moving, &flat), 1.0);
        // tiny but genuine moves still correlate
        let small: Vec<f64> = moving.iter().map(|r| r * 1e-6).collect();
        assert!((pearson(&small, &moving) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_beta_scaled_series() {
        let bench: Vec<f64> = (0..20).map(|i| ((i as f64) * 0.9).sin() * 0.01).collect();
        let asset: Vec<f64> = bench.iter().map(|r| r * 2.0).collect();
        assert!((beta_of(&asset, &bench) - 2.0).abs() < 1e-9);
        assert_eq!(beta_of(&asset[..5], &bench[..5]), 1.0);
        assert_eq!(beta_of(&asset, &[0.0; 20]), 1.0);
    }

    #[tokio::test]
    async fn test_matrix_symmetric_with_unit_diagonal() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_klines("BTCUSDT", bars(&wave(61, 0.02, 0.0))).await;
        exchange.set_klines("ETHUSDT", bars(&wave(61, 0.03, 0.0))).await;
        exchange.set_klines("SOLUSDT", bars(&wave(61, 0.02, 2.0))).await;

        let service = CorrelationService::new(exchange, 60, "5");
        let symbols = vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
        ];
        let m = service.matrix(&symbols).await.unwrap();

        for a in &symbols {
            assert_eq!(m.get(a, a), Some(1.0));
            for b in &symbols {
                assert_eq!(m.get(a, b), m.get(b, a));
            }
        }
        assert!(m.get("BTCUSDT", "ETHUSDT").unwrap() > 0.99);
        let (with, rho) = m
            .max_abs_against("ETHUSDT", &["BTCUSDT".to_string(), "SOLUSDT".to_string()])
            .unwrap();
        assert_eq!(with, "BTCUSDT");
        assert!(rho > 0.99);
    }

    #[tokio::test]
    async fn test_returns_are_cached() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_klines("BTCUSDT", bars(&wave(61, 0.02, 0.0))).await;
        let service = CorrelationService::new(exchange.clone(), 60, "5");

        let first = service.returns("BTCUSDT").await.unwrap();
        exchange.set_klines("BTCUSDT", bars(&[1.0, 2.0])).await;
        let second = service.returns("BTCUSDT").await.unwrap();
        assert_eq!(first, second);
    }
}
