//! Paper venue: simulated crypto up/down markets and an exchange price feed.
//!
//! `PaperMarkets` answers odds lookups with a jittered price around a per-market
//! base; `PaperPriceFeed` random-walks the configured symbols and pushes
//! [`PriceUpdate`]s into the engine channel until shutdown.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::engine::costs::CostConfig;
use crate::platforms::OddsProvider;
use crate::types::{CryptoMarket, MarketOdds, PriceUpdate};

const MIN_ODDS: Decimal = dec!(0.01);
const MAX_ODDS: Decimal = dec!(0.99);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Starting price per exchange symbol.
    pub symbols: BTreeMap<String, Decimal>,
    pub markets_per_asset: usize,
    /// Half-width of the uniform noise added to each odds read.
    pub odds_jitter: Decimal,
    /// Half-width of the band base YES prices are drawn from, around 0.5.
    pub base_odds_spread: f64,
    pub tick_min_ms: u64,
    pub tick_max_ms: u64,
    /// Standard deviation of an ordinary tick's fractional move.
    pub volatility: f64,
    /// Chance that a tick uses `spike_volatility` instead.
    pub spike_probability: f64,
    pub spike_volatility: f64,
    /// Simulated execution costs applied to paper fills.
    pub costs: CostConfig,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let mut symbols = BTreeMap::new();
        symbols.insert("BTC/USDT".to_string(), dec!(50000));
        symbols.insert("ETH/USDT".to_string(), dec!(2500));
        Self {
            symbols,
            markets_per_asset: 2,
            odds_jitter: dec!(0.05),
            base_odds_spread: 0.2,
            tick_min_ms: 1000,
            tick_max_ms: 3000,
            volatility: 0.015,
            spike_probability: 0.15,
            spike_volatility: 0.035,
            costs: CostConfig::default(),
        }
    }
}

impl PaperConfig {
    /// Base assets of the configured symbols, deduplicated.
    pub fn assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self
            .symbols
            .keys()
            .map(|s| s.split('/').next().unwrap_or(s).to_uppercase())
            .collect();
        assets.dedup();
        assets
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

// ---------------------------------------------------------------------------
// Simulated markets
// ---------------------------------------------------------------------------

struct MarketsInner {
    base_odds: HashMap<String, Decimal>,
    rng: StdRng,
}

pub struct PaperMarkets {
    markets: Vec<CryptoMarket>,
    jitter: Decimal,
    inner: Mutex<MarketsInner>,
}

impl PaperMarkets {
    /// Generate `markets_per_asset` markets for every configured asset.
    pub fn new(config: &PaperConfig, timeframe: &str, seed: Option<u64>) -> Self {
        let mut rng = make_rng(seed);
        let spread = config.base_odds_spread.abs();
        let mut listed = Vec::new();

        for asset in config.assets() {
            for i in 0..config.markets_per_asset {
                let market = CryptoMarket {
                    id: format!("{}-updown-{}-{}", asset.to_lowercase(), timeframe, i),
                    question: format!("Will {asset} be higher in {timeframe}? (#{i})"),
                    asset: asset.clone(),
                    timeframe: timeframe.to_string(),
                    end_date: None,
                };
                let draw = if spread > 0.0 { rng.gen_range(-spread..=spread) } else { 0.0 };
                let base = Decimal::from_f64(0.5 + draw)
                    .unwrap_or(dec!(0.5))
                    .round_dp(2)
                    .clamp(MIN_ODDS, MAX_ODDS);
                listed.push((market, base));
            }
        }

        info!(markets = listed.len(), timeframe, "Paper markets generated");
        Self::from_markets(listed, config.odds_jitter, rng)
    }

    /// Fixed market list with explicit base YES prices.
    pub fn with_markets(markets: Vec<(CryptoMarket, Decimal)>, jitter: Decimal, seed: Option<u64>) -> Self {
        Self::from_markets(markets, jitter, make_rng(seed))
    }

    fn from_markets(markets: Vec<(CryptoMarket, Decimal)>, jitter: Decimal, rng: StdRng) -> Self {
        let base_odds = markets.iter().map(|(m, p)| (m.id.clone(), *p)).collect();
        Self {
            markets: markets.into_iter().map(|(m, _)| m).collect(),
            jitter: jitter.abs(),
            inner: Mutex::new(MarketsInner { base_odds, rng }),
        }
    }

    pub fn markets(&self) -> &[CryptoMarket] {
        &self.markets
    }

    /// Move a market's base YES price. Returns false for unknown markets.
    pub async fn set_base_odds(&self, market_id: &str, yes: Decimal) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.base_odds.get_mut(market_id) {
            Some(base) => {
                *base = yes.clamp(MIN_ODDS, MAX_ODDS);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OddsProvider for PaperMarkets {
    async fn market_odds(&self, market_id: &str) -> Result<Option<MarketOdds>> {
        let mut inner = self.inner.lock().await;
        let Some(base) = inner.base_odds.get(market_id).copied() else {
            debug!(market_id, "Unknown paper market");
            return Ok(None);
        };

        let noise = if self.jitter > Decimal::ZERO {
            let j = self.jitter.to_f64().unwrap_or(0.0);
            Decimal::from_f64(inner.rng.gen_range(-j..=j)).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        let yes = (base + noise).round_dp(4).clamp(MIN_ODDS, MAX_ODDS);
        Ok(Some(MarketOdds::from_yes(yes)))
    }

    async fn crypto_markets(&self, asset: &str, timeframe: &str) -> Result<Vec<CryptoMarket>> {
        Ok(self
            .markets
            .iter()
            .filter(|m| m.asset.eq_ignore_ascii_case(asset) && m.timeframe == timeframe)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

// ---------------------------------------------------------------------------
// Simulated exchange feed
// ---------------------------------------------------------------------------

pub struct PaperPriceFeed {
    prices: BTreeMap<String, Decimal>,
    rng: StdRng,
    config: PaperConfig,
}

impl PaperPriceFeed {
    pub fn new(config: PaperConfig, seed: Option<u64>) -> Self {
        Self {
            prices: config.symbols.clone(),
            rng: make_rng(seed),
            config,
        }
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    /// Advance every symbol one step and return the new prices.
    pub fn next_tick(&mut self, now: DateTime<Utc>) -> Vec<PriceUpdate> {
        let mut updates = Vec::with_capacity(self.prices.len());
        for (symbol, price) in self.prices.iter_mut() {
            let std_dev = if self.rng.gen_bool(self.config.spike_probability.clamp(0.0, 1.0)) {
                self.config.spike_volatility
            } else {
                self.config.volatility
            };
            let change = gaussian(&mut self.rng, std_dev).clamp(-0.5, 0.5);
            let factor = Decimal::from_f64(1.0 + change).unwrap_or(Decimal::ONE);
            let next = (*price * factor).round_dp(4);
            if next > Decimal::ZERO {
                *price = next;
            }
            updates.push(PriceUpdate::new(symbol.clone(), *price, now));
        }
        updates
    }

    fn next_delay(&mut self) -> Duration {
        let lo = self.config.tick_min_ms;
        let hi = self.config.tick_max_ms.max(lo);
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }

    /// Publish ticks into `tx` until shutdown is signalled or the receiver closes.
    pub async fn run(mut self, tx: mpsc::Sender<PriceUpdate>, mut shutdown: watch::Receiver<bool>) {
        info!(symbols = self.prices.len(), "Paper price feed started");
        let mut ticks: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            for update in self.next_tick(Utc::now()) {
                debug!(symbol = %update.symbol, price = %update.price, "Paper tick");
                if tx.send(update).await.is_err() {
                    info!(ticks, "Engine channel closed, stopping paper feed");
                    return;
                }
            }
            ticks += 1;
        }

        info!(ticks, "Paper price feed stopped");
    }
}

/// Normal draw via the Box-Muller transform.
fn gaussian(rng: &mut StdRng, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    std_dev * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
