//! Scripted adapters for integration testing.
//!
//! `ScriptedOdds` is an `OddsProvider` whose markets and odds are set from
//! test code; `RecordingNotifier` keeps every alert it receives. Both are
//! in-memory with no external dependencies.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use spikegate::alerts::{AlertEvent, Notifier};
use spikegate::platforms::OddsProvider;
use spikegate::types::{CryptoMarket, MarketOdds};

/// A venue whose odds only move when the test says so.
pub struct ScriptedOdds {
    markets: Vec<CryptoMarket>,
    odds: Arc<Mutex<HashMap<String, Decimal>>>,
    /// If set, every lookup fails with this message.
    force_error: Arc<Mutex<Option<String>>>,
    lookups: Arc<Mutex<usize>>,
}

impl ScriptedOdds {
    pub fn new(markets: Vec<(CryptoMarket, Decimal)>) -> Self {
        let odds = markets.iter().map(|(m, yes)| (m.id.clone(), *yes)).collect();
        Self {
            markets: markets.into_iter().map(|(m, _)| m).collect(),
            odds: Arc::new(Mutex::new(odds)),
            force_error: Arc::new(Mutex::new(None)),
            lookups: Arc::new(Mutex::new(0)),
        }
    }

    /// One BTC 15m market per id, all quoted at `yes`.
    pub fn btc(ids: &[&str], yes: Decimal) -> Self {
        Self::new(ids.iter().map(|id| (make_market(id, "BTC"), yes)).collect())
    }

    pub fn set_yes(&self, market_id: &str, yes: Decimal) {
        self.odds.lock().unwrap().insert(market_id.to_string(), yes);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }

    fn check_error(&self) -> Result<()> {
        *self.lookups.lock().unwrap() += 1;
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OddsProvider for ScriptedOdds {
    async fn market_odds(&self, market_id: &str) -> Result<Option<MarketOdds>> {
        self.check_error()?;
        Ok(self
            .odds
            .lock()
            .unwrap()
            .get(market_id)
            .map(|yes| MarketOdds::from_yes(*yes)))
    }

    async fn crypto_markets(&self, asset: &str, timeframe: &str) -> Result<Vec<CryptoMarket>> {
        self.check_error()?;
        Ok(self
            .markets
            .iter()
            .filter(|m| m.asset.eq_ignore_ascii_case(asset) && m.timeframe == timeframe)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn make_market(id: &str, asset: &str) -> CryptoMarket {
    CryptoMarket {
        id: id.to_string(),
        question: format!("Will {asset} be higher in 15 minutes?"),
        asset: asset.to_string(),
        timeframe: "15m".to_string(),
        end_date: None,
    }
}

/// Collects every alert for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
