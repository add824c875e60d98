//! Risk gate.
//!
//! Admission control for every proposed trade: emergency shutdown, timed
//! trading halts, per-source blocking (manual or win-rate based), the daily
//! loss limit, position size caps and the concurrent position limit. Also
//! owns the counters those checks read, fed back through
//! [`RiskGate::record_trade_result`] whenever the ledger realizes PnL.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{info, warn};

use crate::types::PositionKey;

const MAX_RECENT_OUTCOMES: usize = 100;
const MAX_RISK_EVENTS: usize = 1000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub daily_loss_limit_percent: Decimal,
    pub max_position_size_percent: Decimal,
    pub max_concurrent_positions: usize,
    pub min_win_rate_percent: Decimal,
    pub min_trades_for_win_rate: u32,
    pub auto_block_poor_sources: bool,
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    /// Absolute daily loss (quote currency) that latches emergency shutdown.
    pub emergency_shutdown_loss: Decimal,
    pub halt_hours: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit_percent: dec!(5),
            max_position_size_percent: dec!(5),
            max_concurrent_positions: 10,
            min_win_rate_percent: dec!(50),
            min_trades_for_win_rate: 20,
            auto_block_poor_sources: true,
            stop_loss_percent: dec!(10),
            take_profit_percent: dec!(20),
            emergency_shutdown_loss: dec!(5000),
            halt_hours: 24,
        }
    }
}

impl RiskConfig {
    pub fn max_position_size(&self, balance: Decimal) -> Decimal {
        balance * self.max_position_size_percent / dec!(100)
    }

    pub fn daily_loss_limit(&self, balance: Decimal) -> Decimal {
        balance * self.daily_loss_limit_percent / dec!(100)
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionKind {
    EmergencyShutdown,
    Halted { until: DateTime<Utc> },
    SourceBlocked,
    PoorWinRate { win_rate: Decimal, minimum: Decimal },
    DailyLossLimit { loss: Decimal, limit: Decimal },
    PositionTooLarge { amount: Decimal, limit: Decimal },
    TooManyPositions { open: usize, max: usize },
}

/// Why the gate refused a trade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RiskRejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl RiskRejection {
    fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Halt {
    pub reason: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub timestamp: DateTime<Utc>,
    pub pnl: Decimal,
    pub key: PositionKey,
}

/// Running track record of one signal source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePerformance {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: Decimal,
    pub recent: VecDeque<TradeOutcome>,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub block_reason: Option<String>,
}

impl Default for SourcePerformance {
    fn default() -> Self {
        Self {
            total_trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: Decimal::ZERO,
            recent: VecDeque::new(),
            last_trade_at: None,
            active: true,
            block_reason: None,
        }
    }
}

impl SourcePerformance {
    /// Wins as a percentage of all recorded trades (break-evens count against).
    pub fn win_rate(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.total_trades) * dec!(100)
    }

    fn record(&mut self, pnl: Decimal, key: &PositionKey, now: DateTime<Utc>) {
        self.total_trades += 1;
        self.total_pnl += pnl;
        if pnl > Decimal::ZERO {
            self.wins += 1;
        } else if pnl < Decimal::ZERO {
            self.losses += 1;
        }
        self.recent.push_back(TradeOutcome {
            timestamp: now,
            pnl,
            key: key.clone(),
        });
        while self.recent.len() > MAX_RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.last_trade_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    TradingHalted,
    TradingResumed,
    SourceAutoBlocked,
    SourceManualBlock,
    SourceUnblocked,
    EmergencyShutdown,
    EmergencyReset,
}

impl fmt::Display for RiskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskEventKind::TradingHalted => "TRADING_HALTED",
            RiskEventKind::TradingResumed => "TRADING_RESUMED",
            RiskEventKind::SourceAutoBlocked => "SOURCE_AUTO_BLOCKED",
            RiskEventKind::SourceManualBlock => "SOURCE_MANUAL_BLOCK",
            RiskEventKind::SourceUnblocked => "SOURCE_UNBLOCKED",
            RiskEventKind::EmergencyShutdown => "EMERGENCY_SHUTDOWN",
            RiskEventKind::EmergencyReset => "EMERGENCY_RESET",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: RiskEventKind,
    pub message: String,
    /// Source id for source-level events.
    pub source_id: Option<String>,
}

/// Everything the gate needs to survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_loss: Decimal,
    pub daily_loss_date: NaiveDate,
    pub halt: Option<Halt>,
    pub emergency_shutdown: Option<String>,
    pub blocked_sources: BTreeSet<String>,
    pub sources: BTreeMap<String, SourcePerformance>,
    pub events: VecDeque<RiskEvent>,
}

impl RiskState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_loss: Decimal::ZERO,
            daily_loss_date: today,
            halt: None,
            emergency_shutdown: None,
            blocked_sources: BTreeSet::new(),
            sources: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }
}

/// Point-in-time summary for logs and notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskStatus {
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
    pub halt_until: Option<DateTime<Utc>>,
    pub emergency_shutdown: Option<String>,
    pub daily_loss: Decimal,
    pub daily_loss_date: NaiveDate,
    pub blocked_sources: Vec<String>,
    pub tracked_sources: usize,
}

/// Inputs for one admission check.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub source_id: String,
    pub market_id: String,
    pub current_balance: Decimal,
    pub trade_amount: Decimal,
    pub open_positions: usize,
}

/// Result of sizing a trade against the position cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSize {
    pub amount: Decimal,
    pub capped: bool,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct RiskGate {
    config: RiskConfig,
    state: RiskState,
    /// Events not yet handed to the notifier.
    pending: Vec<RiskEvent>,
}

impl RiskGate {
    pub fn new(config: RiskConfig, now: DateTime<Utc>) -> Self {
        Self::from_state(config, RiskState::new(now.date_naive()))
    }

    pub fn from_state(config: RiskConfig, state: RiskState) -> Self {
        Self {
            config,
            state,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Admission check; first failing rule wins.
    pub fn check_trade_allowed(
        &mut self,
        proposal: &TradeProposal,
        now: DateTime<Utc>,
    ) -> Result<(), RiskRejection> {
        let result = self.evaluate(proposal, now);
        if let Err(rejection) = &result {
            warn!(
                source_id = %proposal.source_id,
                market_id = %proposal.market_id,
                amount = format!("${:.2}", proposal.trade_amount),
                balance = format!("${:.2}", proposal.current_balance),
                kind = ?rejection.kind,
                reason = %rejection.message,
                "Trade rejected by risk gate"
            );
        }
        result
    }

    fn evaluate(&mut self, proposal: &TradeProposal, now: DateTime<Utc>) -> Result<(), RiskRejection> {
        self.roll_day(now);

        if let Some(reason) = &self.state.emergency_shutdown {
            return Err(RiskRejection::new(
                RejectionKind::EmergencyShutdown,
                format!("Emergency shutdown active: {reason}"),
            ));
        }

        if let Some(halt) = self.state.halt.clone() {
            if now < halt.until {
                return Err(RiskRejection::new(
                    RejectionKind::Halted { until: halt.until },
                    format!("Trading halted: {}", halt.reason),
                ));
            }
            self.state.halt = None;
            info!(reason = %halt.reason, "Trading halt expired, resuming");
            self.record_event(
                RiskEventKind::TradingResumed,
                format!("Halt expired ({})", halt.reason),
                None,
                now,
            );
        }

        if self.state.blocked_sources.contains(&proposal.source_id) {
            let reason = self
                .state
                .sources
                .get(&proposal.source_id)
                .and_then(|perf| perf.block_reason.as_deref())
                .unwrap_or("no reason recorded");
            return Err(RiskRejection::new(
                RejectionKind::SourceBlocked,
                format!("Source is blocked: {reason}"),
            ));
        }

        if self.config.auto_block_poor_sources {
            if let Some(perf) = self.state.sources.get(&proposal.source_id) {
                let win_rate = perf.win_rate();
                if perf.total_trades >= self.config.min_trades_for_win_rate
                    && win_rate < self.config.min_win_rate_percent
                {
                    let reason = format!(
                        "Win rate {:.1}% below {}%",
                        win_rate, self.config.min_win_rate_percent
                    );
                    self.block_source(&proposal.source_id, &reason, RiskEventKind::SourceAutoBlocked, now);
                    return Err(RiskRejection::new(
                        RejectionKind::PoorWinRate {
                            win_rate,
                            minimum: self.config.min_win_rate_percent,
                        },
                        reason,
                    ));
                }
            }
        }

        let loss_limit = self.config.daily_loss_limit(proposal.current_balance);
        if self.state.daily_loss >= loss_limit {
            let reason = format!(
                "Daily loss limit hit: ${:.2} >= ${:.2}",
                self.state.daily_loss, loss_limit
            );
            self.halt(reason, now);
            return Err(RiskRejection::new(
                RejectionKind::DailyLossLimit {
                    loss: self.state.daily_loss,
                    limit: loss_limit,
                },
                "Daily loss limit reached",
            ));
        }

        let max_size = self.config.max_position_size(proposal.current_balance);
        if proposal.trade_amount > max_size {
            return Err(RiskRejection::new(
                RejectionKind::PositionTooLarge {
                    amount: proposal.trade_amount,
                    limit: max_size,
                },
                format!(
                    "Trade size ${:.2} exceeds max position size ${:.2}",
                    proposal.trade_amount, max_size
                ),
            ));
        }

        if proposal.open_positions >= self.config.max_concurrent_positions {
            return Err(RiskRejection::new(
                RejectionKind::TooManyPositions {
                    open: proposal.open_positions,
                    max: self.config.max_concurrent_positions,
                },
                format!(
                    "Max concurrent positions ({}) reached",
                    self.config.max_concurrent_positions
                ),
            ));
        }

        Ok(())
    }

    /// Apply the copy percentage and cap at the max position size.
    pub fn calculate_position_size(
        &self,
        intended: Decimal,
        balance: Decimal,
        copy_percent: Decimal,
    ) -> PositionSize {
        let requested = intended * copy_percent / dec!(100);
        let max_size = self.config.max_position_size(balance);

        if requested > max_size {
            warn!(
                requested = format!("${:.2}", requested),
                capped_to = format!("${:.2}", max_size),
                max_pct = %self.config.max_position_size_percent,
                "Capping position size"
            );
            return PositionSize {
                amount: max_size,
                capped: true,
            };
        }

        PositionSize {
            amount: requested,
            capped: false,
        }
    }

    /// Feed a realized result back into source stats and the daily loss bucket.
    pub fn record_trade_result(
        &mut self,
        source_id: &str,
        pnl: Decimal,
        key: &PositionKey,
        now: DateTime<Utc>,
    ) {
        self.roll_day(now);

        self.state
            .sources
            .entry(source_id.to_string())
            .or_default()
            .record(pnl, key, now);

        if pnl < Decimal::ZERO {
            self.state.daily_loss += pnl.abs();
        }

        if self.state.emergency_shutdown.is_none()
            && self.state.daily_loss >= self.config.emergency_shutdown_loss
        {
            let reason = format!(
                "Daily loss ${:.2} exceeds emergency limit ${:.2}",
                self.state.daily_loss, self.config.emergency_shutdown_loss
            );
            warn!(reason = %reason, "EMERGENCY SHUTDOWN");
            self.state.emergency_shutdown = Some(reason.clone());
            self.record_event(RiskEventKind::EmergencyShutdown, reason, None, now);
        }
    }

    /// Block a source by hand. Returns false if it was already blocked.
    pub fn manual_block_source(&mut self, source_id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        if self.state.blocked_sources.contains(source_id) {
            return false;
        }
        self.block_source(source_id, reason, RiskEventKind::SourceManualBlock, now);
        true
    }

    /// Returns false if the source was not blocked.
    pub fn unblock_source(&mut self, source_id: &str, now: DateTime<Utc>) -> bool {
        if !self.state.blocked_sources.remove(source_id) {
            return false;
        }
        if let Some(perf) = self.state.sources.get_mut(source_id) {
            perf.active = true;
            perf.block_reason = None;
        }
        info!(source_id, "Source unblocked");
        self.record_event(
            RiskEventKind::SourceUnblocked,
            format!("Unblocked {source_id}"),
            Some(source_id.to_string()),
            now,
        );
        true
    }

    /// Lift a halt before it expires. Returns false if not halted.
    pub fn resume_trading(&mut self, now: DateTime<Utc>) -> bool {
        let Some(halt) = self.state.halt.take() else {
            return false;
        };
        info!(reason = %halt.reason, "Trading manually resumed");
        self.record_event(
            RiskEventKind::TradingResumed,
            format!("Manually resumed ({})", halt.reason),
            None,
            now,
        );
        true
    }

    /// Clear the emergency latch. Returns false if it was not set.
    pub fn reset_emergency_shutdown(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.emergency_shutdown.take().is_none() {
            return false;
        }
        warn!("Resetting emergency shutdown flag");
        self.record_event(RiskEventKind::EmergencyReset, "Emergency shutdown reset".to_string(), None, now);
        true
    }

    pub fn is_emergency_shutdown(&self) -> bool {
        self.state.emergency_shutdown.is_some()
    }

    pub fn risk_status(&self, now: DateTime<Utc>) -> RiskStatus {
        let active_halt = self.state.halt.as_ref().filter(|h| now < h.until);
        let same_day = self.state.daily_loss_date == now.date_naive();
        RiskStatus {
            trading_halted: active_halt.is_some(),
            halt_reason: active_halt.map(|h| h.reason.clone()),
            halt_until: active_halt.map(|h| h.until),
            emergency_shutdown: self.state.emergency_shutdown.clone(),
            daily_loss: if same_day { self.state.daily_loss } else { Decimal::ZERO },
            daily_loss_date: now.date_naive(),
            blocked_sources: self.state.blocked_sources.iter().cloned().collect(),
            tracked_sources: self.state.sources.len(),
        }
    }

    pub fn source_performance(&self, source_id: &str) -> Option<&SourcePerformance> {
        self.state.sources.get(source_id)
    }

    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<&RiskEvent> {
        self.state.events.iter().rev().take(limit).collect()
    }

    /// Drain events raised since the last call.
    pub fn take_pending_events(&mut self) -> Vec<RiskEvent> {
        std::mem::take(&mut self.pending)
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.daily_loss_date != today {
            if self.state.daily_loss > Decimal::ZERO {
                info!(
                    date = %self.state.daily_loss_date,
                    loss = format!("${:.2}", self.state.daily_loss),
                    "Daily loss bucket rolled over"
                );
            }
            self.state.daily_loss = Decimal::ZERO;
            self.state.daily_loss_date = today;
        }
    }

    fn halt(&mut self, reason: String, now: DateTime<Utc>) {
        if self.state.halt.is_some() {
            return;
        }
        warn!(reason = %reason, hours = self.config.halt_hours, "Trading halted");
        self.state.halt = Some(Halt {
            reason: reason.clone(),
            since: now,
            until: now + Duration::hours(self.config.halt_hours),
        });
        self.record_event(RiskEventKind::TradingHalted, reason, None, now);
    }

    fn block_source(&mut self, source_id: &str, reason: &str, kind: RiskEventKind, now: DateTime<Utc>) {
        self.state.blocked_sources.insert(source_id.to_string());
        let perf = self.state.sources.entry(source_id.to_string()).or_default();
        perf.active = false;
        perf.block_reason = Some(reason.to_string());
        warn!(source_id, reason, event = %kind, "Source blocked");
        self.record_event(
            kind,
            format!("Blocked {source_id}: {reason}"),
            Some(source_id.to_string()),
            now,
        );
    }

    fn record_event(&mut self, kind: RiskEventKind, message: String, source_id: Option<String>, now: DateTime<Utc>) {
        let event = RiskEvent {
            timestamp: now,
            kind,
            message,
            source_id,
        };
        self.state.events.push_back(event.clone());
        while self.state.events.len() > MAX_RISK_EVENTS {
            self.state.events.pop_front();
        }
        self.pending.push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn make_gate() -> RiskGate {
        RiskGate::new(RiskConfig::default(), t0())
    }

    fn make_proposal(amount: Decimal) -> TradeProposal {
        TradeProposal {
            source_id: "binance:BTC/USDT".to_string(),
            market_id: "btc-15m".to_string(),
            current_balance: dec!(10000),
            trade_amount: amount,
            open_positions: 0,
        }
    }

    fn key() -> PositionKey {
        PositionKey::new("btc-15m", "Yes")
    }

    #[test]
    fn test_allows_normal_trade() {
        let mut gate = make_gate();
        assert!(gate.check_trade_allowed(&make_proposal(dec!(400)), t0()).is_ok());
    }

    #[test]
    fn test_rejects_oversized_trade() {
        let mut gate = make_gate();
        let err = gate.check_trade_allowed(&make_proposal(dec!(800)), t0()).unwrap_err();
        assert_eq!(
            err.kind,
            RejectionKind::PositionTooLarge {
                amount: dec!(800),
                limit: dec!(500)
            }
        );
        assert!(err.to_string().contains("exceeds max position size"));
    }

    #[test]
    fn test_rejects_too_many_positions() {
        let mut gate = make_gate();
        let mut proposal = make_proposal(dec!(100));
        proposal.open_positions = 10;
        let err = gate.check_trade_allowed(&proposal, t0()).unwrap_err();
        assert!(matches!(err.kind, RejectionKind::TooManyPositions { open: 10, max: 10 }));
    }

    #[test]
    fn test_poor_win_rate_auto_blocks() {
        let mut gate = make_gate();
        let source = "binance:BTC/USDT";
        for i in 0..20 {
            gate.record_trade_result(source, dec!(-1), &key(), t0() + Duration::seconds(i));
        }

        let err = gate.check_trade_allowed(&make_proposal(dec!(100)), t0()).unwrap_err();
        assert!(matches!(err.kind, RejectionKind::PoorWinRate { .. }));
        assert!(gate.state().blocked_sources.contains(source));
        assert!(!gate.source_performance(source).unwrap().active);

        // Subsequent checks see the block itself.
        let err = gate.check_trade_allowed(&make_proposal(dec!(100)), t0()).unwrap_err();
        assert_eq!(err.kind, RejectionKind::SourceBlocked);
        assert!(err.message.starts_with("Source is blocked: Win rate"), "{}", err.message);

        let events = gate.take_pending_events();
        assert!(events.iter().any(|e| e.kind == RiskEventKind::SourceAutoBlocked));
    }

    #[test]
    fn test_win_rate_needs_min_trades() {
        let mut gate = make_gate();
        for _ in 0..19 {
            gate.record_trade_result("binance:BTC/USDT", dec!(-1), &key(), t0());
        }
        assert!(gate.check_trade_allowed(&make_proposal(dec!(100)), t0()).is_ok());
    }

    #[test]
    fn test_daily_loss_halts_until_expiry() {
        let mut gate = make_gate();
        gate.record_trade_result("other", dec!(-600), &key(), t0());

        let err = gate.check_trade_allowed(&make_proposal(dec!(100)), t0()).unwrap_err();
        assert!(matches!(err.kind, RejectionKind::DailyLossLimit { .. }));
        let halt = gate.state().halt.clone().unwrap();
        assert_eq!(halt.until, t0() + Duration::hours(24));

        // Still halted one minute before expiry, even though the day rolled.
        let before = halt.until - Duration::minutes(1);
        let err = gate.check_trade_allowed(&make_proposal(dec!(100)), before).unwrap_err();
        assert!(matches!(err.kind, RejectionKind::Halted { .. }));

        // Auto-resumes once the halt elapses; the loss bucket belongs to yesterday.
        assert!(gate.check_trade_allowed(&make_proposal(dec!(100)), halt.until).is_ok());
        assert!(gate.state().halt.is_none());
        let kinds: Vec<_> = gate.take_pending_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![RiskEventKind::TradingHalted, RiskEventKind::TradingResumed]);
    }

    #[test]
    fn test_halt_is_idempotent() {
        let mut gate = make_gate();
        gate.record_trade_result("other", dec!(-600), &key(), t0());
        let _ = gate.check_trade_allowed(&make_proposal(dec!(100)), t0());
        let first = gate.state().halt.clone();
        let _ = gate.check_trade_allowed(&make_proposal(dec!(100)), t0() + Duration::hours(1));
        assert_eq!(gate.state().halt, first);
        let halts = gate
            .recent_events(10)
            .iter()
            .filter(|e| e.kind == RiskEventKind::TradingHalted)
            .count();
        assert_eq!(halts, 1);
    }

    #[test]
    fn test_day_rollover_resets_daily_loss() {
        let mut gate = make_gate();
        gate.record_trade_result("s", dec!(-100), &key(), t0());
        assert_eq!(gate.state().daily_loss, dec!(100));

        gate.record_trade_result("s", dec!(5), &key(), t0() + Duration::days(1));
        assert_eq!(gate.state().daily_loss, Decimal::ZERO);
        assert_eq!(gate.state().daily_loss_date, (t0() + Duration::days(1)).date_naive());
    }

    #[test]
    fn test_emergency_shutdown_latches() {
        let mut gate = RiskGate::new(
            RiskConfig {
                emergency_shutdown_loss: dec!(1000),
                ..Default::default()
            },
            t0(),
        );
        gate.record_trade_result("s", dec!(-1200), &key(), t0());
        assert!(gate.is_emergency_shutdown());

        // Survives the halt expiring and the day rolling.
        let later = t0() + Duration::days(3);
        let err = gate.check_trade_allowed(&make_proposal(dec!(10)), later).unwrap_err();
        assert_eq!(err.kind, RejectionKind::EmergencyShutdown);

        assert!(gate.reset_emergency_shutdown(later));
        assert!(!gate.reset_emergency_shutdown(later));
        assert!(gate.check_trade_allowed(&make_proposal(dec!(10)), later).is_ok());
    }

    #[test]
    fn test_calculate_position_size() {
        let gate = make_gate();
        let size = gate.calculate_position_size(dec!(200), dec!(10000), dec!(100));
        assert_eq!(size, PositionSize { amount: dec!(200), capped: false });

        let half = gate.calculate_position_size(dec!(200), dec!(10000), dec!(50));
        assert_eq!(half.amount, dec!(100));

        let capped = gate.calculate_position_size(dec!(2000), dec!(10000), dec!(100));
        assert_eq!(capped, PositionSize { amount: dec!(500), capped: true });
    }

    #[test]
    fn test_record_trade_result_tracks_source() {
        let mut gate = make_gate();
        gate.record_trade_result("s", dec!(10), &key(), t0());
        gate.record_trade_result("s", dec!(-4), &key(), t0());
        gate.record_trade_result("s", Decimal::ZERO, &key(), t0());

        let perf = gate.source_performance("s").unwrap();
        assert_eq!(perf.total_trades, 3);
        assert_eq!(perf.wins, 1);
        assert_eq!(perf.losses, 1);
        assert_eq!(perf.total_pnl, dec!(6));
        assert_eq!(perf.recent.len(), 3);
        assert_eq!(gate.state().daily_loss, dec!(4));
    }

    #[test]
    fn test_recent_outcomes_capped() {
        let mut gate = make_gate();
        for _ in 0..150 {
            gate.record_trade_result("s", dec!(1), &key(), t0());
        }
        assert_eq!(gate.source_performance("s").unwrap().recent.len(), 100);
        assert_eq!(gate.source_performance("s").unwrap().total_trades, 150);
    }

    #[test]
    fn test_manual_block_and_unblock() {
        let mut gate = make_gate();
        let source = "binance:BTC/USDT";
        assert!(gate.manual_block_source(source, "testing", t0()));
        assert!(!gate.manual_block_source(source, "again", t0()));

        let err = gate.check_trade_allowed(&make_proposal(dec!(10)), t0()).unwrap_err();
        assert_eq!(err.kind, RejectionKind::SourceBlocked);
        assert_eq!(err.message, "Source is blocked: testing");

        assert!(gate.unblock_source(source, t0()));
        assert!(!gate.unblock_source(source, t0()));
        assert!(gate.check_trade_allowed(&make_proposal(dec!(10)), t0()).is_ok());
    }

    #[test]
    fn test_resume_trading_clears_halt() {
        let mut gate = make_gate();
        assert!(!gate.resume_trading(t0()));
        gate.record_trade_result("other", dec!(-600), &key(), t0());
        let _ = gate.check_trade_allowed(&make_proposal(dec!(100)), t0());
        assert!(gate.risk_status(t0()).trading_halted);

        assert!(gate.resume_trading(t0()));
        assert!(!gate.risk_status(t0()).trading_halted);
    }

    #[test]
    fn test_risk_status_reports_halt_and_blocks() {
        let mut gate = make_gate();
        gate.manual_block_source("bad", "manual", t0());
        let status = gate.risk_status(t0());
        assert!(!status.trading_halted);
        assert_eq!(status.blocked_sources, vec!["bad".to_string()]);
        assert_eq!(status.tracked_sources, 1);
    }

    #[test]
    fn test_risk_state_json_roundtrip() {
        let mut gate = make_gate();
        gate.record_trade_result("s", dec!(-100), &key(), t0());
        gate.manual_block_source("bad", "manual", t0());

        let json = serde_json::to_string(gate.state()).unwrap();
        let state: RiskState = serde_json::from_str(&json).unwrap();
        let restored = RiskGate::from_state(RiskConfig::default(), state);

        assert_eq!(restored.state().daily_loss, dec!(100));
        assert!(restored.state().blocked_sources.contains("bad"));
        assert_eq!(restored.source_performance("s").unwrap().total_trades, 1);
        assert_eq!(restored.recent_events(10).len(), 1);
    }
}
