//! Spike detection and opportunity scoring.
//!
//! Keeps a short rolling price history per exchange symbol. When the
//! underlying moves sharply inside the spike window and the prediction
//! market has not yet repriced, the move is scored as an [`Opportunity`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::types::Direction;

// ---------------------------------------------------------------------------
// Configuration (defaults, overridden by config.toml at runtime)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum fractional move that counts as a spike (0.015 = 1.5%).
    pub spike_threshold: Decimal,
    /// Minimum expected profit fraction after fees.
    pub min_profit_threshold: Decimal,
    pub history_window_secs: i64,
    /// Hard cap on snapshots kept per symbol.
    pub max_history: usize,
    pub spike_window_secs: i64,
    pub cooldown_secs: i64,
    /// Venue fee deducted from expected profit.
    pub fee_rate: Decimal,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            spike_threshold: dec!(0.015),
            min_profit_threshold: dec!(0.02),
            history_window_secs: 30,
            max_history: 100,
            spike_window_secs: 10,
            cooldown_secs: 60,
            fee_rate: dec!(0.02),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A qualifying move of the underlying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub symbol: String,
    pub direction: Direction,
    /// Signed fractional change from the baseline.
    pub change: Decimal,
    pub magnitude: Decimal,
    pub baseline: Decimal,
    pub current: Decimal,
    pub window_secs: i64,
    pub detected_at: DateTime<Utc>,
}

/// Everything needed to score one (symbol, market, direction) candidate.
#[derive(Debug, Clone)]
pub struct OpportunityInput {
    pub symbol: String,
    pub exchange: String,
    pub exchange_price: Decimal,
    pub market_id: String,
    /// YES price of the market (0–1).
    pub market_odds: Decimal,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub exchange: String,
    pub exchange_price: Decimal,
    pub market_id: String,
    pub market_odds: Decimal,
    pub direction: Direction,
    pub spike_change: Decimal,
    pub divergence: Decimal,
    pub expected_profit: Decimal,
    /// 0–1 score.
    pub confidence: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Opportunity {
    /// Signal origin used by the risk gate for source tracking.
    pub fn source_id(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct SpikeDetector {
    config: DetectorConfig,
    history: HashMap<String, VecDeque<PriceSnapshot>>,
    recent: Vec<Opportunity>,
}

impl SpikeDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
            recent: Vec::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Append a snapshot and evict by age and count.
    ///
    /// A repeat observation at the latest timestamp replaces that snapshot,
    /// so scoring several markets off one tick does not crowd the history.
    pub fn update_price(&mut self, symbol: &str, price: Decimal, timestamp: DateTime<Utc>) {
        let window = Duration::seconds(self.config.history_window_secs);
        let max = self.config.max_history.max(1);
        let history = self.history.entry(symbol.to_string()).or_default();

        match history.back_mut() {
            Some(last) if last.timestamp == timestamp => last.price = price,
            _ => history.push_back(PriceSnapshot { price, timestamp }),
        }

        let cutoff = timestamp - window;
        while history.front().is_some_and(|s| s.timestamp < cutoff) {
            history.pop_front();
        }
        while history.len() > max {
            history.pop_front();
        }
    }

    pub fn history_len(&self, symbol: &str) -> usize {
        self.history.get(symbol).map_or(0, VecDeque::len)
    }

    /// Compare `current_price` to the oldest snapshot inside the window.
    pub fn detect_spike(
        &self,
        symbol: &str,
        current_price: Decimal,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Option<Spike> {
        let history = self.history.get(symbol)?;
        if history.len() < 2 {
            return None;
        }

        let cutoff = now - Duration::seconds(window_secs);
        let baseline = history.iter().find(|s| s.timestamp >= cutoff)?.price;
        if baseline.is_zero() {
            return None;
        }

        let change = (current_price - baseline) / baseline;
        if change.abs() < self.config.spike_threshold {
            return None;
        }

        let direction = if change > Decimal::ZERO {
            Direction::Up
        } else {
            Direction::Down
        };

        info!(
            symbol,
            direction = %direction,
            change = format!("{:.2}%", change * dec!(100)),
            window_secs,
            "Spike detected"
        );

        Some(Spike {
            symbol: symbol.to_string(),
            direction,
            change,
            magnitude: change.abs(),
            baseline,
            current: current_price,
            window_secs,
            detected_at: now,
        })
    }

    /// Record the price, then score a directional opportunity if the
    /// underlying spiked the same way and the market looks stale.
    pub fn detect_opportunity(&mut self, input: OpportunityInput) -> Option<Opportunity> {
        self.update_price(&input.symbol, input.exchange_price, input.timestamp);

        let spike = self.detect_spike(
            &input.symbol,
            input.exchange_price,
            self.config.spike_window_secs,
            input.timestamp,
        )?;
        if spike.direction != input.direction {
            return None;
        }

        let odds = input.market_odds;
        let divergence = match input.direction {
            Direction::Up => spike.magnitude * (Decimal::ONE - odds),
            Direction::Down => spike.magnitude * odds,
        };
        if divergence.abs() < self.config.spike_threshold * dec!(0.5) {
            debug!(
                symbol = %input.symbol,
                market_id = %input.market_id,
                divergence = format!("{:.2}%", divergence * dec!(100)),
                "Divergence below floor"
            );
            return None;
        }

        let expected_profit = self.expected_profit(divergence, odds);
        if expected_profit < self.config.min_profit_threshold {
            debug!(
                symbol = %input.symbol,
                market_id = %input.market_id,
                expected_profit = format!("{:.2}%", expected_profit * dec!(100)),
                "Expected profit below threshold"
            );
            return None;
        }

        let confidence = confidence(divergence, odds);

        let cooldown = Duration::seconds(self.config.cooldown_secs);
        let now = input.timestamp;
        self.recent.retain(|o| now - o.timestamp < cooldown * 2);
        if self.recent.iter().any(|o| {
            o.market_id == input.market_id && o.direction == input.direction && now - o.timestamp < cooldown
        }) {
            debug!(
                market_id = %input.market_id,
                direction = %input.direction,
                "Opportunity suppressed by cooldown"
            );
            return None;
        }

        let opportunity = Opportunity {
            symbol: input.symbol,
            exchange: input.exchange,
            exchange_price: input.exchange_price,
            market_id: input.market_id,
            market_odds: odds,
            direction: input.direction,
            spike_change: spike.change,
            divergence,
            expected_profit,
            confidence,
            timestamp: now,
        };

        info!(
            symbol = %opportunity.symbol,
            market_id = %opportunity.market_id,
            direction = %opportunity.direction,
            divergence = format!("{:.2}%", divergence * dec!(100)),
            expected_profit = format!("{:.2}%", expected_profit * dec!(100)),
            confidence = format!("{:.2}", confidence),
            "Opportunity detected"
        );

        self.recent.push(opportunity.clone());
        Some(opportunity)
    }

    /// Opportunities still inside the dedupe horizon.
    pub fn recent_opportunities(&self) -> &[Opportunity] {
        &self.recent
    }

    fn expected_profit(&self, divergence: Decimal, odds: Decimal) -> Decimal {
        (divergence.abs() * (Decimal::ONE - odds) - self.config.fee_rate).max(Decimal::ZERO)
    }
}

/// Blend of divergence strength (70%) and distance of the odds from 50/50 (30%).
fn confidence(divergence: Decimal, odds: Decimal) -> Decimal {
    let divergence_score = (divergence.abs() / dec!(0.20)).min(Decimal::ONE);
    let odds_score = (odds - dec!(0.5)).abs() * dec!(2);
    divergence_score * dec!(0.7) + odds_score * dec!(0.3)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
