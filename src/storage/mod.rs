//! Persistence layer.
//!
//! [`StateStore`] is the boundary the engine writes through after every
//! fill: positions are upserted by id, trades are appended, the cash balance
//! is overwritten, and small state blobs (the risk gate's counters) go into
//! a key/value table. `MemoryStore` backs tests and throwaway runs;
//! [`sqlite::SqliteStore`] is the durable implementation.

pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::accountant::PerformanceStats;
use crate::engine::ledger::LedgerState;
use crate::types::{Position, PositionStatus, TradeRecord};

/// Key under which the risk gate's state is stored.
pub const RISK_STATE_KEY: &str = "risk_state";

/// Trades reloaded into memory on restart.
pub const DEFAULT_TRADE_RELOAD_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "memory" or "sqlite".
    pub backend: String,
    pub url: String,
    /// JSON report written on shutdown.
    pub export_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            url: "sqlite://spikegate.db?mode=rwc".to_string(),
            export_path: None,
        }
    }
}

/// Open the configured backend.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend.as_str() {
        "memory" => {
            info!("Using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        "sqlite" => {
            let store = sqlite::SqliteStore::connect(&config.url)
                .await
                .with_context(|| format!("Failed to open SQLite store at {}", config.url))?;
            info!(url = %config.url, "Using SQLite store");
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("Unknown storage backend: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Stored snapshot
// ---------------------------------------------------------------------------

/// What a store hands back on startup.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub open_positions: Vec<Position>,
    /// Oldest first.
    pub closed_positions: Vec<Position>,
    /// Newest first, at most the requested limit.
    pub trades: Vec<TradeRecord>,
}

impl StoredState {
    pub fn into_ledger_state(self) -> LedgerState {
        LedgerState {
            initial_balance: self.initial_balance,
            balance: self.balance,
            positions: self
                .open_positions
                .into_iter()
                .map(|p| (p.key.clone(), p))
                .collect::<BTreeMap<_, _>>(),
            closed_positions: self.closed_positions,
            trades: self.trades.into_iter().collect::<VecDeque<_>>(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a position by id.
    async fn save_position(&self, position: &Position) -> Result<()>;

    /// Append a trade. Saving the same trade id twice is a no-op.
    async fn save_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn save_balance(&self, initial_balance: Decimal, balance: Decimal) -> Result<()>;

    /// None when nothing has been saved yet.
    async fn load_state(&self, trade_limit: usize) -> Result<Option<StoredState>>;

    async fn set_state(&self, key: &str, value: &str) -> Result<()>;

    async fn get_state(&self, key: &str) -> Result<Option<String>>;

    /// Drop everything.
    async fn clear(&self) -> Result<()>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    balance: Option<(Decimal, Decimal)>,
    positions: HashMap<String, Position>,
    trades: Vec<TradeRecord>,
    kv: HashMap<String, String>,
}

/// Volatile store; everything lives until the process exits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trade_count(&self) -> usize {
        self.inner.lock().await.trades.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_position(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.positions.insert(position.id.clone(), position.clone());
        Ok(())
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.trades.iter().any(|t| t.id == trade.id) {
            inner.trades.push(trade.clone());
        }
        Ok(())
    }

    async fn save_balance(&self, initial_balance: Decimal, balance: Decimal) -> Result<()> {
        self.inner.lock().await.balance = Some((initial_balance, balance));
        Ok(())
    }

    async fn load_state(&self, trade_limit: usize) -> Result<Option<StoredState>> {
        let inner = self.inner.lock().await;
        let Some((initial_balance, balance)) = inner.balance else {
            return Ok(None);
        };

        let mut open_positions: Vec<Position> = Vec::new();
        let mut closed_positions: Vec<Position> = Vec::new();
        for pos in inner.positions.values() {
            match pos.status {
                PositionStatus::Open => open_positions.push(pos.clone()),
                PositionStatus::Closed => closed_positions.push(pos.clone()),
            }
        }
        open_positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        closed_positions.sort_by(|a, b| a.closed_at.cmp(&b.closed_at));

        let trades = inner.trades.iter().rev().take(trade_limit).cloned().collect();

        Ok(Some(StoredState {
            initial_balance,
            balance,
            open_positions,
            closed_positions,
            trades,
        }))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().await.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.kv.get(key).cloned())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock().await = MemoryInner::default();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// JSON export
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ExportReport<'a> {
    exported_at: chrono::DateTime<Utc>,
    performance: &'a PerformanceStats,
    positions: Vec<&'a Position>,
    closed_positions: &'a [Position],
    trades: &'a VecDeque<TradeRecord>,
}

/// Write a JSON report of the ledger and its statistics.
pub fn export_json(path: &str, state: &LedgerState, stats: &PerformanceStats) -> Result<()> {
    let report = ExportReport {
        exported_at: Utc::now(),
        performance: stats,
        positions: state.positions.values().collect(),
        closed_positions: &state.closed_positions,
        trades: &state.trades,
    };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialise export report")?;

    std::fs::write(path, &json).context(format!("Failed to write export to {path}"))?;

    info!(
        path,
        trades = state.trades.len(),
        open_positions = state.positions.len(),
        "Ledger exported"
    );
    debug!(bytes = json.len(), "Export size");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
