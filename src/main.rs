use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consensus_trader::application::actors::{request_pass, ReconciliationActor, ReconciliationMessage};
use consensus_trader::application::cycle_runner::{CycleError, CycleOutcome, CycleRunner};
use consensus_trader::config::TradingConfig;
use consensus_trader::domain::entities::market::AccountBalance;
use consensus_trader::domain::repositories::ai_provider::AiProvider;
use consensus_trader::domain::repositories::alert_dispatcher::{AlertDispatcher, TracingAlertDispatcher};
use consensus_trader::domain::repositories::exchange_client::ExchangeClient;
use consensus_trader::domain::repositories::kv_store::{InMemoryKvStore, KvStore};
use consensus_trader::domain::repositories::trade_store::TradeStore;
use consensus_trader::domain::services::gap_detector::GapDetector;
use consensus_trader::domain::services::reconciliation::ReconciliationService;
use consensus_trader::infrastructure::http_provider::HttpAiProvider;
use consensus_trader::infrastructure::market_data::ExchangeMarketData;
use consensus_trader::infrastructure::paper_exchange::PaperExchange;
use consensus_trader::infrastructure::rate_limit::RateLimitedExchange;
use consensus_trader::infrastructure::redis_store::RedisKvStore;
use consensus_trader::persistence::init_database_with;
use consensus_trader::persistence::repository::{DecisionAuditRepository, SqliteTradeStore};
use consensus_trader::task_runner::{run_periodic, RetryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        // a missing .env is the normal case in production
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consensus_trader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TradingConfig::from_env();
    info!(
        policy_version = %config.policy.version,
        symbols = ?config.symbols,
        providers = config.providers.len(),
        "consensus trader starting"
    );

    // Venue
    let paper = Arc::new(PaperExchange::new());
    paper
        .set_balance(AccountBalance {
            equity: config.paper_equity,
            free_collateral: config.paper_equity,
            margin_utilization: 0.0,
        })
        .await;
    let exchange: Arc<dyn ExchangeClient> = Arc::new(RateLimitedExchange::new(paper, &config.rate_limit));

    // Shared fast store
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKvStore::connect(url, config.redis_prefix.clone()).await?),
        None => {
            warn!("REDIS_URL not set, breaker state and leases are process-local");
            Arc::new(InMemoryKvStore::new())
        }
    };

    // Storage
    let pool = init_database_with(&config.database).await?;
    let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(pool.clone()));
    let audit = Arc::new(DecisionAuditRepository::new(pool));
    let alerts: Arc<dyn AlertDispatcher> = Arc::new(TracingAlertDispatcher);

    let mut providers: Vec<Arc<dyn AiProvider>> = Vec::new();
    for provider_config in config.providers.iter().cloned() {
        let name = provider_config.name.clone();
        match HttpAiProvider::new(provider_config) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(e) => error!(provider = %name, "failed to build provider: {}", e),
        }
    }
    if providers.len() < config.policy.consensus.quorum {
        warn!(
            providers = providers.len(),
            quorum = config.policy.consensus.quorum,
            "fewer providers than quorum, every cycle will end in NO_TRADE"
        );
    }

    let market_data = Arc::new(ExchangeMarketData::new(
        exchange.clone(),
        store.clone(),
        config.risk.clone(),
        config.kline_interval.clone(),
    ));

    let runner = Arc::new(
        CycleRunner::from_policy(
            &config.policy,
            providers,
            market_data,
            exchange.clone(),
            kv.clone(),
            store.clone(),
            audit,
            alerts.clone(),
        )
        .with_gap_detector(Arc::new(GapDetector::from_policy(&config.policy.reconciliation))),
    );

    let reconciliation = Arc::new(
        ReconciliationService::new(exchange, store, alerts, config.policy.reconciliation.clone())
            .with_cycle_lock(runner.lease().clone()),
    );
    let reconciliation_tx = ReconciliationActor::spawn(reconciliation, config.reconciliation_timeout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for symbol in config.symbols.clone() {
        let runner = runner.clone();
        let shutdown = shutdown_rx.clone();
        let interval = config.cycle_interval();
        tasks.push(tokio::spawn(async move {
            let task_name = format!("cycle:{}", symbol);
            run_periodic(&task_name, interval, RetryConfig::default(), shutdown, || {
                let runner = runner.clone();
                let symbol = symbol.clone();
                async move {
                    let outcome = runner.run_symbol(&symbol).await?;
                    log_outcome(&symbol, &outcome);
                    Ok::<(), CycleError>(())
                }
            })
            .await;
        }));
    }

    if config.reconciliation_enabled {
        let tx = reconciliation_tx.clone();
        let shutdown = shutdown_rx.clone();
        let interval = config.reconciliation_interval();
        tasks.push(tokio::spawn(async move {
            run_periodic("reconciliation", interval, RetryConfig::default(), shutdown, || {
                let tx = tx.clone();
                async move { request_pass(&tx).await.map(|_| ()) }
            })
            .await;
        }));
    } else {
        warn!("reconciliation disabled");
    }

    info!("Trader started successfully. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("Trader shutting down gracefully...");
    if shutdown_tx.send(true).is_err() {
        warn!("no periodic task was listening for shutdown");
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!("periodic task ended abnormally: {}", e);
        }
    }
    if reconciliation_tx.send(ReconciliationMessage::Shutdown).await.is_err() {
        warn!("reconciliation actor already stopped");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn log_outcome(symbol: &str, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Opened(trade) => info!(
            symbol,
            trade_id = %trade.id,
            qty = trade.qty,
            entry = trade.entry_price,
            "position opened"
        ),
        CycleOutcome::RiskRejected(verdict) => warn!(symbol, verdict = ?verdict, "open blocked by risk gate"),
        CycleOutcome::ExecutionFailed(report) => warn!(symbol, report = ?report, "order ladder failed"),
        CycleOutcome::OpenFailed { reason } => error!(symbol, reason = %reason, "fill not booked"),
        other => info!(symbol, outcome = ?other, "cycle finished"),
    }
}
