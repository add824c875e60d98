//! Per-position exit rules.
//!
//! Stop-loss and take-profit thresholds come from the risk settings; the
//! expiry timers reflect the 15-minute markets the engine trades.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::strategy::risk::RiskConfig;
use crate::types::{CloseReason, Position};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Close once held this long, ahead of market resolution.
    pub soft_expiry_secs: i64,
    /// Market is certainly resolved past this point.
    pub hard_expiry_secs: i64,
    /// Loss fraction that triggers a stop (0.10 = 10%).
    #[serde(skip)]
    pub stop_loss_pct: Decimal,
    #[serde(skip)]
    pub take_profit_pct: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            soft_expiry_secs: 14 * 60 + 30,
            hard_expiry_secs: 20 * 60,
            stop_loss_pct: dec!(0.10),
            take_profit_pct: dec!(0.20),
        }
    }
}

impl ExitConfig {
    /// Take stop-loss / take-profit percentages from the risk settings.
    pub fn with_risk_limits(mut self, risk: &RiskConfig) -> Self {
        self.stop_loss_pct = risk.stop_loss_percent / dec!(100);
        self.take_profit_pct = risk.take_profit_percent / dec!(100);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// No usable price; nothing can be decided.
    Abstain,
    Hold,
    Close(CloseReason),
}

pub struct ExitEvaluator {
    config: ExitConfig,
}

impl ExitEvaluator {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Decide whether `position` should close at `current_price`.
    ///
    /// Priority: stop-loss, take-profit, hard expiry, soft expiry.
    pub fn evaluate(
        &self,
        position: &Position,
        current_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        // Zero is a real quote: a market that resolved against the position.
        let Some(price) = current_price.filter(|p| *p >= Decimal::ZERO) else {
            debug!(key = %position.key, "No current price, abstaining");
            return ExitDecision::Abstain;
        };
        let Some(pnl_pct) = position.pnl_fraction(price) else {
            return ExitDecision::Abstain;
        };

        if pnl_pct <= -self.config.stop_loss_pct {
            warn!(
                key = %position.key,
                pnl = format!("{:.2}%", pnl_pct * dec!(100)),
                "Stop loss triggered"
            );
            return ExitDecision::Close(CloseReason::StopLoss);
        }

        if pnl_pct >= self.config.take_profit_pct {
            info!(
                key = %position.key,
                pnl = format!("{:.2}%", pnl_pct * dec!(100)),
                "Take profit triggered"
            );
            return ExitDecision::Close(CloseReason::TakeProfit);
        }

        let held = position.held_for(now);
        if held >= Duration::seconds(self.config.hard_expiry_secs) {
            warn!(
                key = %position.key,
                held_mins = format!("{:.1}", held.num_seconds() as f64 / 60.0),
                "Force closing expired position"
            );
            return ExitDecision::Close(CloseReason::TimeExpired);
        }

        if held >= Duration::seconds(self.config.soft_expiry_secs) {
            info!(key = %position.key, "Closing position before expiration");
            return ExitDecision::Close(CloseReason::ApproachingExpiry);
        }

        ExitDecision::Hold
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
