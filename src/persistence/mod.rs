//! Persistence Layer
//!
//! SQLite storage for the trade book and the decision audit trail, through
//! sqlx.
//!
//! # Database Schema
//!
//! ## Trades Table
//! - id: UUID
//! - symbol, side ("LONG" | "SHORT"), qty, entry_price, leverage
//! - stop_loss, take_profit: optional protective levels
//! - status: "OPEN" | "CLOSED" | "CANCELLED"
//! - provenance: "CYCLE" | "RECONCILIATION_ORPHAN" | "MANUAL"
//! - realized_pnl, fees, exit_price, close_reason
//! - exchange_order_id, protection_order_id, cycle_id
//! - opened_at, closed_at, updated_at
//!
//! At most one OPEN row per (symbol, provenance), enforced by a partial
//! unique index.
//!
//! ## Decision Audit Table
//! - id: Serial
//! - cycle_id, symbol, provider, stage ("R1" | "R2" | "FINAL")
//! - action, confidence, latency_ms, reason, policy_version
//! - input_context, raw_output: JSON
//! - created_at
//!
//! Append-only.

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

/// Initialize the database connection pool and run migrations
///
/// `database_url` is e.g. `sqlite://data/trader.db` or `sqlite::memory:`.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!(url = %config.url, "initializing database");

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

    // every connection to an in-memory database is a separate database
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections.max(1)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    info!("database ready");
    Ok(pool)
}

async fn migrate(pool: &DbPool, name: &str, sql: &str) -> Result<(), DatabaseError> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("{}: {}", name, e)))?;
    Ok(())
}

/// Idempotent schema setup
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("running database migrations");

    migrate(
        pool,
        "create trades",
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            qty REAL NOT NULL,
            entry_price REAL NOT NULL,
            leverage INTEGER NOT NULL,
            stop_loss REAL,
            take_profit REAL,
            status TEXT NOT NULL CHECK(status IN ('OPEN', 'CLOSED', 'CANCELLED')),
            provenance TEXT NOT NULL,
            realized_pnl REAL,
            fees REAL NOT NULL DEFAULT 0.0,
            exit_price REAL,
            close_reason TEXT,
            exchange_order_id TEXT,
            protection_order_id TEXT,
            cycle_id TEXT,
            opened_at DATETIME NOT NULL,
            closed_at DATETIME,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    migrate(
        pool,
        "create one_open_trade index",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_one_open ON trades(symbol, provenance) WHERE status = 'OPEN'",
    )
    .await?;

    migrate(
        pool,
        "create trades status index",
        "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
    )
    .await?;

    migrate(
        pool,
        "create decision_audit",
        r#"
        CREATE TABLE IF NOT EXISTS decision_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            provider TEXT NOT NULL,
            stage TEXT NOT NULL CHECK(stage IN ('R1', 'R2', 'FINAL')),
            action TEXT,
            confidence INTEGER CHECK(confidence IS NULL OR (confidence BETWEEN 0 AND 100)),
            input_context TEXT NOT NULL,
            raw_output TEXT NOT NULL,
            latency_ms INTEGER,
            reason TEXT NOT NULL DEFAULT '',
            policy_version TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .await?;

    migrate(
        pool,
        "create decision_audit cycle index",
        "CREATE INDEX IF NOT EXISTS idx_decision_audit_cycle ON decision_audit(cycle_id)",
    )
    .await?;

    info!("database migrations completed");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/trader.db")
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/trader.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => config.max_connections = n,
                _ => warn!(value = %raw, "invalid DATABASE_MAX_CONNECTIONS, keeping default"),
            }
        }
        config
    }
}
