//! Market-data adapters.
//!
//! Defines the `OddsProvider` trait the engine queries for prediction-market
//! prices and provides implementations for:
//! - Paper: simulated crypto up/down markets and a random-walk price feed
//! - Polymarket: read-only odds from the Gamma API

pub mod paper;
pub mod polymarket;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CryptoMarket, MarketOdds};

/// Source of binary-market prices.
///
/// Implementors own their own transport concerns (timeouts, retries). The
/// engine treats any error as "no signal this cycle".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OddsProvider: Send + Sync {
    /// Current YES/NO prices, or None if the market is unknown or unpriced.
    async fn market_odds(&self, market_id: &str) -> Result<Option<MarketOdds>>;

    /// Active up/down markets for an asset ticker ("BTC") and horizon ("15m").
    async fn crypto_markets(&self, asset: &str, timeframe: &str) -> Result<Vec<CryptoMarket>>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}
