//! Core engine: price event → opportunity → risk gate → paper fill.
//!
//! [`TradingCore`] owns the ledger, detector, risk gate and exit evaluator and
//! is purely synchronous: the [`runner`] gathers odds from adapters first,
//! then takes the core lock for one decision cycle and acts on the returned
//! [`CycleOutcome`] (persistence, alerts) after releasing it.

pub mod accountant;
pub mod costs;
pub mod ledger;
pub mod runner;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEvent;
use crate::engine::accountant::{Accountant, PerformanceStats};
use crate::engine::costs::{CostConfig, ExecutionCosts};
use crate::engine::ledger::{Fill, FillRequest, Ledger, LedgerState};
use crate::strategy::detector::{DetectorConfig, Opportunity, OpportunityInput, SpikeDetector};
use crate::strategy::exit::{ExitConfig, ExitDecision, ExitEvaluator};
use crate::strategy::risk::{RiskConfig, RiskGate, RiskState, RiskStatus, TradeProposal};
use crate::types::{
    CloseReason, CryptoMarket, Direction, LedgerError, MarketOdds, PositionKey, PriceUpdate,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub initial_balance: Decimal,
    /// Capacity of the price-event channel.
    pub channel_capacity: usize,
    pub exit_check_interval_secs: u64,
    pub status_interval_secs: u64,
    /// How long a market listing is reused before asking the venue again.
    pub market_refresh_secs: u64,
    /// Intended notional per trade before the copy percentage and caps.
    pub trade_size: Decimal,
    pub copy_percent: Decimal,
    /// Exchange label used in source ids.
    pub exchange: String,
    pub timeframe: String,
    /// "paper" or "polymarket".
    pub odds_source: String,
    /// Seeds slippage and the paper venue for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "SPIKEGATE-001".to_string(),
            initial_balance: dec!(10000),
            channel_capacity: 1024,
            exit_check_interval_secs: 3,
            status_interval_secs: 30,
            market_refresh_secs: 60,
            trade_size: dec!(100),
            copy_percent: dec!(100),
            exchange: "paper".to_string(),
            timeframe: "15m".to_string(),
            odds_source: "paper".to_string(),
            seed: None,
        }
    }
}

/// Everything needed to assemble a [`TradingCore`].
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub engine: EngineConfig,
    pub detector: DetectorConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub costs: CostConfig,
    /// Write a JSON report here on shutdown.
    pub export_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Cycle results
// ---------------------------------------------------------------------------

/// A market and its odds at the time of a price update.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketQuote {
    pub market: CryptoMarket,
    pub odds: MarketOdds,
}

/// Side effects of one locked decision cycle, applied after the lock drops.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub fills: Vec<Fill>,
    pub alerts: Vec<AlertEvent>,
    pub initial_balance: Decimal,
    pub balance: Decimal,
    /// Serialized risk state when it changed during the cycle.
    pub risk_state: Option<String>,
}

impl CycleOutcome {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty() && self.alerts.is_empty() && self.risk_state.is_none()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub price_updates: u64,
    pub opportunities: u64,
    pub rejected: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
}

/// Read-only copy of the engine for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub ledger: LedgerState,
    pub risk: RiskStatus,
    pub counters: EngineCounters,
    pub performance: PerformanceStats,
}

// ---------------------------------------------------------------------------
// Trading core
// ---------------------------------------------------------------------------

pub struct TradingCore {
    ledger: Ledger,
    detector: SpikeDetector,
    gate: RiskGate,
    evaluator: ExitEvaluator,
    engine: EngineConfig,
    counters: EngineCounters,
}

impl TradingCore {
    pub fn new(
        ledger: Ledger,
        detector: SpikeDetector,
        gate: RiskGate,
        evaluator: ExitEvaluator,
        engine: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            detector,
            gate,
            evaluator,
            engine,
            counters: EngineCounters::default(),
        }
    }

    /// Assemble from settings, resuming from persisted state when given.
    pub fn build(
        settings: &EngineSettings,
        ledger_state: Option<LedgerState>,
        risk_state: Option<RiskState>,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let costs = ExecutionCosts::uniform(settings.costs.clone(), settings.engine.seed);
        let ledger = match ledger_state {
            Some(state) => Ledger::from_state(state, costs)?,
            None => Ledger::new(settings.engine.initial_balance, costs),
        };
        let gate = match risk_state {
            Some(state) => RiskGate::from_state(settings.risk.clone(), state),
            None => RiskGate::new(settings.risk.clone(), now),
        };
        let exit = settings.exit.clone().with_risk_limits(&settings.risk);

        Ok(Self::new(
            ledger,
            SpikeDetector::new(settings.detector.clone()),
            gate,
            ExitEvaluator::new(exit),
            settings.engine.clone(),
        ))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn gate(&self) -> &RiskGate {
        &self.gate
    }

    /// Manual risk operations (unblock, resume, emergency reset).
    pub fn gate_mut(&mut self) -> &mut RiskGate {
        &mut self.gate
    }

    pub fn detector(&self) -> &SpikeDetector {
        &self.detector
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    /// Keys of all open positions.
    pub fn open_keys(&self) -> Vec<PositionKey> {
        self.ledger.positions().into_iter().map(|p| p.key.clone()).collect()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: now,
            ledger: self.ledger.state(),
            risk: self.gate.risk_status(now),
            counters: self.counters,
            performance: Accountant::performance_stats(self.ledger.state_ref(), now.date_naive()),
        }
    }

    pub fn risk_state_json(&self) -> Option<String> {
        match serde_json::to_string(self.gate.state()) {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "Failed to serialise risk state");
                None
            }
        }
    }

    // -- Entry path -------------------------------------------------------

    /// Score every (market, direction) pair for this tick and open positions
    /// for the ones the gate admits. Also marks open positions in the quoted
    /// markets.
    pub fn on_price(&mut self, update: &PriceUpdate, quotes: &[MarketQuote]) -> CycleOutcome {
        self.counters.price_updates += 1;
        let mut out = CycleOutcome::default();
        let now = update.timestamp;

        if quotes.is_empty() {
            self.detector.update_price(&update.symbol, update.price, now);
        }

        for quote in quotes {
            for direction in Direction::ALL {
                let input = OpportunityInput {
                    symbol: update.symbol.clone(),
                    exchange: self.engine.exchange.clone(),
                    exchange_price: update.price,
                    market_id: quote.market.id.clone(),
                    market_odds: quote.odds.yes,
                    direction,
                    timestamp: now,
                };
                if let Some(opp) = self.detector.detect_opportunity(input) {
                    self.counters.opportunities += 1;
                    self.try_open(&opp, &quote.odds, now, &mut out);
                }
            }
        }

        let marks = self.marks_from_quotes(quotes);
        if !marks.is_empty() {
            self.ledger.mark_prices(&marks);
        }

        self.finish(&mut out);
        out
    }

    fn try_open(&mut self, opp: &Opportunity, odds: &MarketOdds, now: DateTime<Utc>, out: &mut CycleOutcome) {
        let outcome = opp.direction.outcome();
        let Some(price) = odds.price_for(outcome) else {
            return;
        };
        let key = PositionKey::new(opp.market_id.clone(), outcome);
        if self.ledger.position(&key).is_some() {
            debug!(key = %key, "Already holding this outcome, skipping");
            return;
        }

        let balance = self.ledger.balance();
        let size = self
            .gate
            .calculate_position_size(self.engine.trade_size, balance, self.engine.copy_percent);
        if size.amount <= Decimal::ZERO || price <= Decimal::ZERO {
            return;
        }

        // The gate limits what the ledger will debit, not the bare notional.
        let costs = self.ledger.costs().config();
        let cap = self.gate.config().max_position_size(balance);
        let notional = if costs.max_buy_cost(size.amount) > cap {
            costs.notional_within(cap)
        } else {
            size.amount
        };
        let shares = (notional / price).round_dp_with_strategy(6, RoundingStrategy::ToZero);
        if shares <= Decimal::ZERO {
            return;
        }

        let proposal = TradeProposal {
            source_id: opp.source_id(),
            market_id: opp.market_id.clone(),
            current_balance: balance,
            trade_amount: costs.max_buy_cost(notional),
            open_positions: self.ledger.open_position_count(),
        };
        if self.gate.check_trade_allowed(&proposal, now).is_err() {
            self.counters.rejected += 1;
            return;
        }

        let req = FillRequest::buy(key, opp.symbol.clone(), opp.direction, opp.source_id(), shares, price, now);
        match self.ledger.execute(req) {
            Ok(fill) => {
                self.counters.positions_opened += 1;
                info!(
                    position = self.counters.positions_opened,
                    symbol = %opp.symbol,
                    direction = %opp.direction,
                    key = %fill.position.key,
                    price = format!("{:.4}", fill.trade.price),
                    cost = format!("${:.2}", fill.trade.total_cost),
                    "Position opened"
                );
                out.alerts.push(AlertEvent::TradeOpened {
                    symbol: opp.symbol.clone(),
                    key: fill.position.key.clone(),
                    direction: opp.direction,
                    amount: fill.trade.total_cost,
                    price: fill.trade.price,
                    divergence: opp.divergence,
                });
                out.fills.push(fill);
            }
            Err(e) => {
                self.counters.rejected += 1;
                warn!(market_id = %opp.market_id, error = %e, "Paper buy rejected by ledger");
            }
        }
    }

    fn marks_from_quotes(&self, quotes: &[MarketQuote]) -> HashMap<PositionKey, Decimal> {
        let mut marks = HashMap::new();
        for quote in quotes {
            for outcome in ["Yes", "No"] {
                let key = PositionKey::new(quote.market.id.clone(), outcome);
                if self.ledger.position(&key).is_some() {
                    if let Some(price) = quote.odds.price_for(outcome) {
                        marks.insert(key, price);
                    }
                }
            }
        }
        marks
    }

    // -- Exit path --------------------------------------------------------

    /// Mark open positions at `prices` and close those the evaluator flags.
    pub fn check_exits(&mut self, prices: &HashMap<PositionKey, Decimal>, now: DateTime<Utc>) -> CycleOutcome {
        let mut out = CycleOutcome::default();
        self.ledger.mark_prices(prices);

        let decisions: Vec<(PositionKey, Decimal, CloseReason)> = self
            .ledger
            .positions()
            .into_iter()
            .filter_map(|pos| {
                let price = prices.get(&pos.key).copied();
                match self.evaluator.evaluate(pos, price, now) {
                    ExitDecision::Close(reason) => price.map(|p| (pos.key.clone(), p, reason)),
                    ExitDecision::Hold | ExitDecision::Abstain => None,
                }
            })
            .collect();

        for (key, price, reason) in decisions {
            self.close_position(&key, price, reason, now, &mut out);
        }

        self.finish(&mut out);
        out
    }

    /// Close every open position with reason `Shutdown` at the best price
    /// available: `prices`, else the last mark, else the entry price,
    /// clamped to `[0, 1]`.
    pub fn close_all(&mut self, prices: &HashMap<PositionKey, Decimal>, now: DateTime<Utc>) -> CycleOutcome {
        let mut out = CycleOutcome::default();

        let targets: Vec<(PositionKey, Decimal)> = self
            .ledger
            .positions()
            .into_iter()
            .map(|pos| {
                let price = prices
                    .get(&pos.key)
                    .copied()
                    .or(pos.current_price)
                    .unwrap_or(pos.entry_price)
                    .clamp(Decimal::ZERO, Decimal::ONE);
                (pos.key.clone(), price)
            })
            .collect();

        for (key, price) in targets {
            self.close_position(&key, price, CloseReason::Shutdown, now, &mut out);
        }

        self.finish(&mut out);
        out
    }

    fn close_position(
        &mut self,
        key: &PositionKey,
        price: Decimal,
        reason: CloseReason,
        now: DateTime<Utc>,
        out: &mut CycleOutcome,
    ) {
        let Some(shares) = self.ledger.position(key).map(|p| p.shares) else {
            return;
        };

        match self.ledger.execute(FillRequest::sell(key.clone(), shares, price, reason, now)) {
            Ok(fill) => {
                if let Some(pnl) = fill.trade.realized_pnl {
                    self.gate.record_trade_result(&fill.trade.source_id, pnl, key, now);
                    self.counters.positions_closed += 1;
                    out.alerts.push(AlertEvent::TradeClosed {
                        symbol: fill.position.symbol.clone(),
                        key: key.clone(),
                        pnl,
                        held_secs: fill.position.held_for(now).num_seconds(),
                        reason,
                    });
                }
                out.fills.push(fill);
            }
            Err(e) => {
                error!(key = %key, reason = %reason, error = %e, "Failed to close position");
            }
        }
    }

    /// Drain risk events into alerts and stamp balances on the outcome.
    fn finish(&mut self, out: &mut CycleOutcome) {
        let events = self.gate.take_pending_events();
        let risk_changed = !events.is_empty() || out.fills.iter().any(|f| f.trade.is_realized());
        out.alerts.extend(events.iter().filter_map(AlertEvent::from_risk_event));

        out.initial_balance = self.ledger.initial_balance();
        out.balance = self.ledger.balance();
        if risk_changed {
            out.risk_state = self.risk_state_json();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
