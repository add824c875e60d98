//! Shared types for the SPIKEGATE engine.
//!
//! These types form the data model used across all modules.
//! They are kept free of behaviour that needs I/O so that the strategy,
//! engine and storage modules can all depend on them without cycles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Direction of an underlying price move (and of the market we bet on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Both directions, in the order the engine checks them.
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    /// Outcome label bought when trading this direction.
    pub fn outcome(&self) -> &'static str {
        match self {
            Direction::Up => "Yes",
            Direction::Down => "No",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            _ => Err(anyhow::anyhow!("Unknown direction: {s}")),
        }
    }
}

/// Whether a position profits from the price rising (long) or falling (short).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            _ => Err(anyhow::anyhow!("Unknown position side: {s}")),
        }
    }
}

/// Side of a single fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            _ => Err(anyhow::anyhow!("Unknown trade side: {s}")),
        }
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TimeExpired,
    ApproachingExpiry,
    Manual,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::TimeExpired => "time_expired",
            CloseReason::ApproachingExpiry => "approaching_expiry",
            CloseReason::Manual => "manual",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "time_expired" => Ok(CloseReason::TimeExpired),
            "approaching_expiry" => Ok(CloseReason::ApproachingExpiry),
            "manual" => Ok(CloseReason::Manual),
            "shutdown" => Ok(CloseReason::Shutdown),
            _ => Err(anyhow::anyhow!("Unknown close reason: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Composite ledger key: one position per (market, outcome).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub market_id: String,
    pub outcome: String,
}

impl PositionKey {
    pub fn new(market_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            outcome: outcome.into(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market_id, self.outcome)
    }
}

/// Current YES/NO prices of a binary market (0–1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub yes: Decimal,
    pub no: Decimal,
}

impl MarketOdds {
    /// Build from a YES price, deriving NO as its complement.
    pub fn from_yes(yes: Decimal) -> Self {
        Self { yes, no: Decimal::ONE - yes }
    }

    /// Price of the given outcome label ("Yes"/"No", case-insensitive).
    pub fn price_for(&self, outcome: &str) -> Option<Decimal> {
        match outcome.to_lowercase().as_str() {
            "yes" => Some(self.yes),
            "no" => Some(self.no),
            _ => None,
        }
    }
}

impl fmt::Display for MarketOdds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "YES: {:.1}¢ | NO: {:.1}¢",
            self.yes * dec!(100),
            self.no * dec!(100)
        )
    }
}

/// A short-horizon crypto up/down market on the prediction venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoMarket {
    pub id: String,
    pub question: String,
    /// Underlying asset ticker, e.g. "BTC".
    pub asset: String,
    /// Resolution horizon label, e.g. "15m".
    pub timeframe: String,
    pub end_date: Option<DateTime<Utc>>,
}

/// A single price observation from an exchange feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Exchange symbol, e.g. "BTC/USDT".
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdate {
    pub fn new(symbol: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }

    /// Base asset of the symbol ("BTC" for "BTC/USDT").
    pub fn asset(&self) -> &str {
        self.symbol.split('/').next().unwrap_or(&self.symbol)
    }
}

// ---------------------------------------------------------------------------
// Positions & trades
// ---------------------------------------------------------------------------

/// A virtual holding, open or closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    /// Exchange symbol whose spike produced the position.
    pub symbol: String,
    pub key: PositionKey,
    pub direction: Direction,
    pub side: PositionSide,
    /// Signal origin whose performance is tracked by the risk gate.
    pub source_id: String,
    pub shares: Decimal,
    /// Volume-weighted average executed price.
    pub entry_price: Decimal,
    /// Quote currency spent on the shares still held (incl. fees and gas).
    pub cost_basis: Decimal,
    pub current_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub status: PositionStatus,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pnl = self.unrealized_pnl;
        let pnl_sign = if pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "[{}] {} {} {} shares={:.4} entry={:.4} ({pnl_sign}{pnl:.2})",
            self.symbol, self.side, self.direction, self.key, self.shares, self.entry_price,
        )
    }
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Signed return of `price` against the entry, per side.
    /// Returns None when the entry price is not positive.
    pub fn pnl_fraction(&self, price: Decimal) -> Option<Decimal> {
        if self.entry_price <= Decimal::ZERO {
            return None;
        }
        let delta = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        Some(delta / self.entry_price)
    }

    /// Mark the position to a new reference price.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = Some(price);
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.shares,
            PositionSide::Short => (self.entry_price - price) * self.shares,
        };
    }

    /// Value of the holding at the last mark (entry price if never marked).
    pub fn market_value(&self) -> Decimal {
        self.shares * self.current_price.unwrap_or(self.entry_price)
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}

/// Immutable audit entry for one ledger fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub position_id: String,
    pub key: PositionKey,
    pub side: TradeSide,
    pub shares: Decimal,
    /// Executed (post-slippage) price.
    pub price: Decimal,
    pub quoted_price: Decimal,
    pub slippage: Decimal,
    pub amount: Decimal,
    pub fees: Decimal,
    pub gas_cost: Decimal,
    pub total_cost: Decimal,
    pub balance_after: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_percent: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.4} {} @ {:.4} (fees: ${:.4}, gas: ${:.4})",
            self.side, self.shares, self.key, self.price, self.fees, self.gas_cost,
        )?;
        if let Some(pnl) = self.realized_pnl {
            write!(f, " PnL ${pnl:.2}")?;
        }
        Ok(())
    }
}

impl TradeRecord {
    /// Whether this fill closed its position for good.
    pub fn is_close(&self) -> bool {
        self.close_reason.is_some()
    }

    /// Whether this fill realized PnL: any sell, partial or closing.
    pub fn is_realized(&self) -> bool {
        self.realized_pnl.is_some()
    }

    /// Signed balance change caused by this fill.
    pub fn balance_delta(&self) -> Decimal {
        match self.side {
            TradeSide::Buy => -self.total_cost,
            TradeSide::Sell => self.amount - self.fees - self.gas_cost,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Structured ledger rejections. None of these are fatal except
/// `CorruptState`, which aborts startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient balance: need ${needed:.2}, have ${available:.2}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("No open position for {0}")]
    NoSuchPosition(PositionKey),

    #[error("Insufficient shares: requested {requested:.4}, held {held:.4}")]
    InsufficientShares { requested: Decimal, held: Decimal },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Reset not confirmed")]
    ResetNotConfirmed,

    #[error("Corrupt ledger state: {0}")]
    CorruptState(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
