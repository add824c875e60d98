//! SQLite-backed [`StateStore`].
//!
//! Decimals are stored as TEXT so balances survive a restart exactly;
//! timestamps as fixed-width RFC 3339 strings.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use super::{StateStore, StoredState};
use crate::types::{CloseReason, Position, PositionKey, PositionStatus, TradeRecord};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS account (
        id              INTEGER PRIMARY KEY CHECK (id = 1),
        initial_balance TEXT NOT NULL,
        balance         TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS positions (
        id             TEXT PRIMARY KEY,
        symbol         TEXT NOT NULL,
        market_id      TEXT NOT NULL,
        outcome        TEXT NOT NULL,
        direction      TEXT NOT NULL,
        side           TEXT NOT NULL,
        source_id      TEXT NOT NULL,
        shares         TEXT NOT NULL,
        entry_price    TEXT NOT NULL,
        cost_basis     TEXT NOT NULL,
        current_price  TEXT,
        realized_pnl   TEXT NOT NULL,
        unrealized_pnl TEXT NOT NULL,
        opened_at      TEXT NOT NULL,
        closed_at      TEXT,
        close_reason   TEXT,
        status         TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS trades (
        seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
        id                   TEXT NOT NULL UNIQUE,
        timestamp            TEXT NOT NULL,
        source_id            TEXT NOT NULL,
        position_id          TEXT NOT NULL,
        market_id            TEXT NOT NULL,
        outcome              TEXT NOT NULL,
        side                 TEXT NOT NULL,
        shares               TEXT NOT NULL,
        price                TEXT NOT NULL,
        quoted_price         TEXT NOT NULL,
        slippage             TEXT NOT NULL,
        amount               TEXT NOT NULL,
        fees                 TEXT NOT NULL,
        gas_cost             TEXT NOT NULL,
        total_cost           TEXT NOT NULL,
        balance_after        TEXT NOT NULL,
        realized_pnl         TEXT,
        realized_pnl_percent TEXT,
        close_reason         TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_trades_market ON trades (market_id)",
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status)",
    r"
    CREATE TABLE IF NOT EXISTS kv_state (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the file if needed) and ensure the schema exists.
    ///
    /// `database_url` is e.g. `sqlite://spikegate.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // A single connection keeps `sqlite::memory:` on one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open SQLite database: {database_url}"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to apply SQLite schema")?;
        }

        info!(url = database_url, "SQLite store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn load_positions(&self, status: PositionStatus, limit: Option<usize>) -> Result<Vec<Position>> {
        let rows = match status {
            PositionStatus::Open => {
                sqlx::query("SELECT * FROM positions WHERE status = 'open' ORDER BY opened_at ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
            PositionStatus::Closed => {
                let limit = limit.map_or(-1, |l| l as i64);
                // Newest N, then flipped back to oldest first.
                let mut rows = sqlx::query(
                    "SELECT * FROM positions WHERE status = 'closed' ORDER BY closed_at DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
        };
        rows.iter().map(position_from_row).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO positions (
                id, symbol, market_id, outcome, direction, side, source_id, shares,
                entry_price, cost_basis, current_price, realized_pnl, unrealized_pnl,
                opened_at, closed_at, close_reason, status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                shares = excluded.shares,
                entry_price = excluded.entry_price,
                cost_basis = excluded.cost_basis,
                current_price = excluded.current_price,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                closed_at = excluded.closed_at,
                close_reason = excluded.close_reason,
                status = excluded.status
            ",
        )
        .bind(&position.id)
        .bind(&position.symbol)
        .bind(&position.key.market_id)
        .bind(&position.key.outcome)
        .bind(position.direction.to_string())
        .bind(position.side.to_string().to_lowercase())
        .bind(&position.source_id)
        .bind(position.shares.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.cost_basis.to_string())
        .bind(position.current_price.map(|p| p.to_string()))
        .bind(position.realized_pnl.to_string())
        .bind(position.unrealized_pnl.to_string())
        .bind(ts(&position.opened_at))
        .bind(position.closed_at.as_ref().map(ts))
        .bind(position.close_reason.map(|r| r.as_str()))
        .bind(status_str(position.status))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save position {}", position.id))?;
        Ok(())
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO trades (
                id, timestamp, source_id, position_id, market_id, outcome, side, shares,
                price, quoted_price, slippage, amount, fees, gas_cost, total_cost,
                balance_after, realized_pnl, realized_pnl_percent, close_reason
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ",
        )
        .bind(&trade.id)
        .bind(ts(&trade.timestamp))
        .bind(&trade.source_id)
        .bind(&trade.position_id)
        .bind(&trade.key.market_id)
        .bind(&trade.key.outcome)
        .bind(trade.side.to_string().to_lowercase())
        .bind(trade.shares.to_string())
        .bind(trade.price.to_string())
        .bind(trade.quoted_price.to_string())
        .bind(trade.slippage.to_string())
        .bind(trade.amount.to_string())
        .bind(trade.fees.to_string())
        .bind(trade.gas_cost.to_string())
        .bind(trade.total_cost.to_string())
        .bind(trade.balance_after.to_string())
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.realized_pnl_percent.map(|p| p.to_string()))
        .bind(trade.close_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save trade {}", trade.id))?;
        Ok(())
    }

    async fn save_balance(&self, initial_balance: Decimal, balance: Decimal) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO account (id, initial_balance, balance, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                initial_balance = excluded.initial_balance,
                balance = excluded.balance,
                updated_at = excluded.updated_at
            ",
        )
        .bind(initial_balance.to_string())
        .bind(balance.to_string())
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save balance")?;
        Ok(())
    }

    async fn load_state(&self, trade_limit: usize) -> Result<Option<StoredState>> {
        let account = sqlx::query("SELECT initial_balance, balance FROM account WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load account row")?;
        let Some(account) = account else {
            return Ok(None);
        };

        let initial_balance = dec_col(&account, "initial_balance")?;
        let balance = dec_col(&account, "balance")?;

        let open_positions = self.load_positions(PositionStatus::Open, None).await?;
        let closed_positions = self
            .load_positions(PositionStatus::Closed, Some(trade_limit))
            .await?;

        let trade_rows = sqlx::query("SELECT * FROM trades ORDER BY seq DESC LIMIT ?1")
            .bind(trade_limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load trades")?;
        let trades = trade_rows.iter().map(trade_from_row).collect::<Result<Vec<_>>>()?;

        info!(
            balance = format!("${:.2}", balance),
            open_positions = open_positions.len(),
            trades = trades.len(),
            "State loaded from SQLite"
        );

        Ok(Some(StoredState {
            initial_balance,
            balance,
            open_positions,
            closed_positions,
            trades,
        }))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to set state {key}"))?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM kv_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to get state {key}"))?;
        Ok(row.map(|(value,)| value))
    }

    async fn clear(&self) -> Result<()> {
        for table in ["account", "positions", "trades", "kv_state"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to clear {table}"))?;
        }
        info!("SQLite store cleared");
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn dec_col(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).with_context(|| format!("Bad decimal in column {col}: {raw}"))
}

fn opt_dec_col(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|r| Decimal::from_str(&r).with_context(|| format!("Bad decimal in column {col}: {r}")))
        .transpose()
}

fn ts_col(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_ts(&raw, col)
}

fn opt_ts_col(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|r| parse_ts(&r, col)).transpose()
}

fn parse_ts(raw: &str, col: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Bad timestamp in column {col}: {raw}"))
}

fn parsed<T: FromStr<Err = anyhow::Error>>(row: &SqliteRow, col: &str) -> Result<T> {
    let raw: String = row.try_get(col)?;
    raw.parse::<T>().map_err(|e| anyhow!("Column {col}: {e}"))
}

fn position_from_row(row: &SqliteRow) -> Result<Position> {
    let status = match row.try_get::<String, _>("status")?.as_str() {
        "open" => PositionStatus::Open,
        "closed" => PositionStatus::Closed,
        other => return Err(anyhow!("Unknown position status: {other}")),
    };
    let close_reason: Option<String> = row.try_get("close_reason")?;

    Ok(Position {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        key: PositionKey::new(
            row.try_get::<String, _>("market_id")?,
            row.try_get::<String, _>("outcome")?,
        ),
        direction: parsed(row, "direction")?,
        side: parsed(row, "side")?,
        source_id: row.try_get("source_id")?,
        shares: dec_col(row, "shares")?,
        entry_price: dec_col(row, "entry_price")?,
        cost_basis: dec_col(row, "cost_basis")?,
        current_price: opt_dec_col(row, "current_price")?,
        realized_pnl: dec_col(row, "realized_pnl")?,
        unrealized_pnl: dec_col(row, "unrealized_pnl")?,
        opened_at: ts_col(row, "opened_at")?,
        closed_at: opt_ts_col(row, "closed_at")?,
        close_reason: close_reason.map(|r| r.parse::<CloseReason>()).transpose()?,
        status,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord> {
    let close_reason: Option<String> = row.try_get("close_reason")?;

    Ok(TradeRecord {
        id: row.try_get("id")?,
        timestamp: ts_col(row, "timestamp")?,
        source_id: row.try_get("source_id")?,
        position_id: row.try_get("position_id")?,
        key: PositionKey::new(
            row.try_get::<String, _>("market_id")?,
            row.try_get::<String, _>("outcome")?,
        ),
        side: parsed(row, "side")?,
        shares: dec_col(row, "shares")?,
        price: dec_col(row, "price")?,
        quoted_price: dec_col(row, "quoted_price")?,
        slippage: dec_col(row, "slippage")?,
        amount: dec_col(row, "amount")?,
        fees: dec_col(row, "fees")?,
        gas_cost: dec_col(row, "gas_cost")?,
        total_cost: dec_col(row, "total_cost")?,
        balance_after: dec_col(row, "balance_after")?,
        realized_pnl: opt_dec_col(row, "realized_pnl")?,
        realized_pnl_percent: opt_dec_col(row, "realized_pnl_percent")?,
        close_reason: close_reason.map(|r| r.parse::<CloseReason>()).transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
