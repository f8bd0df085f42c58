//! Gateway Store
//! Mission: Durable record of accounts, bindings, orders, trades,
//! positions and position history with SQLite

mod accounts;
mod orders;
mod positions;

pub use accounts::NewBinding;
pub use orders::{NewOrder, NewTrade};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// SQLite-backed store shared across services. Methods take short async
/// critical sections on a single connection; SQLite serializes writers
/// anyway so pool sizing knobs only inform the busy timeout.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = Connection::open(&config.url)?;
        conn.busy_timeout(Duration::from_secs(config.pool_timeout_secs))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        debug!(
            url = %config.url,
            pool_size = config.pool_size,
            "sqlite store opened (pool sizing advisory only)"
        );

        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                password_hash TEXT NOT NULL,
                max_position_size_usd REAL NOT NULL DEFAULT 100000.0,
                max_leverage REAL NOT NULL DEFAULT 10.0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS venue_bindings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                venue TEXT NOT NULL,
                name TEXT NOT NULL,
                testnet INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                encrypted_api_key TEXT,
                encrypted_api_secret TEXT,
                encrypted_private_key TEXT,
                wallet_address TEXT,
                vault_index INTEGER,
                total_balance REAL NOT NULL DEFAULT 0.0,
                available_balance REAL NOT NULL DEFAULT 0.0,
                margin_balance REAL NOT NULL DEFAULT 0.0,
                unrealized_pnl REAL NOT NULL DEFAULT 0.0,
                requests_per_minute INTEGER NOT NULL DEFAULT 60,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id),
                UNIQUE (account_id, venue, name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                binding_id INTEGER NOT NULL,
                venue_order_id TEXT,
                client_order_id TEXT UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                quantity REAL NOT NULL,
                filled_quantity REAL NOT NULL DEFAULT 0.0,
                price REAL,
                stop_price REAL,
                average_fill_price REAL,
                reduce_only INTEGER NOT NULL DEFAULT 0,
                post_only INTEGER NOT NULL DEFAULT 0,
                is_isolated INTEGER NOT NULL DEFAULT 0,
                fee REAL NOT NULL DEFAULT 0.0,
                fee_asset TEXT,
                placed_at TEXT,
                filled_at TEXT,
                canceled_at TEXT,
                expires_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id),
                FOREIGN KEY (binding_id) REFERENCES venue_bindings(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER NOT NULL,
                venue_trade_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL NOT NULL,
                fee REAL NOT NULL DEFAULT 0.0,
                fee_asset TEXT,
                is_maker INTEGER NOT NULL DEFAULT 0,
                realized_pnl REAL,
                executed_at TEXT NOT NULL,
                FOREIGN KEY (order_id) REFERENCES orders(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                binding_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity REAL NOT NULL,
                initial_quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                mark_price REAL NOT NULL DEFAULT 0.0,
                liquidation_price REAL,
                exit_price REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0.0,
                realized_pnl REAL NOT NULL DEFAULT 0.0,
                margin REAL NOT NULL DEFAULT 0.0,
                margin_ratio REAL,
                leverage REAL NOT NULL DEFAULT 1.0,
                is_isolated INTEGER NOT NULL DEFAULT 0,
                stop_loss_price REAL,
                take_profit_price REAL,
                stop_loss_order_id TEXT,
                take_profit_order_id TEXT,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id),
                FOREIGN KEY (binding_id) REFERENCES venue_bindings(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS position_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                quantity REAL NOT NULL,
                mark_price REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0.0,
                realized_pnl REAL NOT NULL DEFAULT 0.0,
                margin REAL NOT NULL DEFAULT 0.0,
                bid_price REAL,
                ask_price REAL,
                funding_rate REAL,
                size_delta REAL NOT NULL DEFAULT 0.0,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )",
            [],
        )?;

        // Required index set.
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_binding_status ON orders(binding_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_venue_id ON orders(venue_order_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_account_created ON orders(account_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_binding_symbol_status ON positions(binding_id, symbol, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_executed_at ON trades(executed_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_position ON position_history(position_id, recorded_at)",
            [],
        )?;

    Ok(())
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}
