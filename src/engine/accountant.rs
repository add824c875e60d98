//! Accountant: portfolio valuation, performance stats and daily summaries.
//!
//! Read-only analytics over a [`LedgerState`]. Nothing here mutates the
//! ledger; the engine calls these for status logs, the shutdown report and
//! the daily-summary notification.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;
use tracing::info;

use crate::engine::ledger::LedgerState;
use crate::strategy::risk::RiskStatus;
use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioValue {
    pub balance: Decimal,
    pub positions_value: Decimal,
    pub total_equity: Decimal,
    /// Equity minus the initial balance.
    pub total_pnl: Decimal,
    pub total_pnl_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    /// Fills that realized PnL.
    pub closed_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percent of closing fills with positive PnL.
    pub win_rate: Decimal,
    pub average_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub today_realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub gas_paid: Decimal,
    pub open_positions: usize,
    pub portfolio: PortfolioValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub buys: usize,
    pub closes: usize,
    pub wins: usize,
    pub realized_pnl: Decimal,
    pub balance: Decimal,
    pub total_equity: Decimal,
    pub open_positions: usize,
    pub daily_loss: Decimal,
    pub trading_halted: bool,
    pub emergency_shutdown: bool,
}

impl fmt::Display for DailySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.realized_pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{}: {} buys, {} closes ({} wins), PnL {sign}${:.2}, equity ${:.2}, {} open",
            self.date,
            self.buys,
            self.closes,
            self.wins,
            self.realized_pnl,
            self.total_equity,
            self.open_positions,
        )?;
        if self.emergency_shutdown {
            write!(f, " [EMERGENCY SHUTDOWN]")?;
        } else if self.trading_halted {
            write!(f, " [HALTED]")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// Value open positions at their last mark (entry price if never marked).
    pub fn portfolio_value(state: &LedgerState) -> PortfolioValue {
        let positions_value: Decimal = state.positions.values().map(|p| p.market_value()).sum();
        let total_equity = state.balance + positions_value;
        let total_pnl = total_equity - state.initial_balance;
        let total_pnl_percent = if state.initial_balance > Decimal::ZERO {
            total_pnl / state.initial_balance * dec!(100)
        } else {
            Decimal::ZERO
        };

        PortfolioValue {
            balance: state.balance,
            positions_value,
            total_equity,
            total_pnl,
            total_pnl_percent,
        }
    }

    pub fn performance_stats(state: &LedgerState, today: NaiveDate) -> PerformanceStats {
        let closing: Vec<Decimal> = state.closing_trades().filter_map(|t| t.realized_pnl).collect();
        let wins = closing.iter().filter(|p| **p > Decimal::ZERO).count();
        let losses = closing.iter().filter(|p| **p < Decimal::ZERO).count();
        let total_realized_pnl: Decimal = state.realized_trades().filter_map(|t| t.realized_pnl).sum();

        let (win_rate, average_pnl) = if closing.is_empty() {
            (Decimal::ZERO, Decimal::ZERO)
        } else {
            let n = Decimal::from(closing.len());
            let closing_pnl: Decimal = closing.iter().copied().sum();
            (Decimal::from(wins) / n * dec!(100), closing_pnl / n)
        };

        PerformanceStats {
            total_trades: state.trades.len(),
            closed_trades: closing.len(),
            wins,
            losses,
            win_rate,
            average_pnl,
            total_realized_pnl,
            today_realized_pnl: state.realized_pnl_on(today),
            fees_paid: state.trades.iter().map(|t| t.fees).sum(),
            gas_paid: state.trades.iter().map(|t| t.gas_cost).sum(),
            open_positions: state.positions.len(),
            portfolio: Self::portfolio_value(state),
        }
    }

    pub fn daily_summary(state: &LedgerState, risk: &RiskStatus, date: NaiveDate) -> DailySummary {
        let todays = state.trades.iter().filter(|t| t.timestamp.date_naive() == date);
        let (mut buys, mut closes, mut wins) = (0, 0, 0);
        for trade in todays {
            match trade.side {
                TradeSide::Buy => buys += 1,
                // Partial reductions realize PnL but leave the position open.
                TradeSide::Sell if trade.is_close() => {
                    closes += 1;
                    if trade.realized_pnl.is_some_and(|pnl| pnl > Decimal::ZERO) {
                        wins += 1;
                    }
                }
                TradeSide::Sell => {}
            }
        }

        let portfolio = Self::portfolio_value(state);
        DailySummary {
            date,
            buys,
            closes,
            wins,
            realized_pnl: state.realized_pnl_on(date),
            balance: state.balance,
            total_equity: portfolio.total_equity,
            open_positions: state.positions.len(),
            daily_loss: risk.daily_loss,
            trading_halted: risk.trading_halted,
            emergency_shutdown: risk.emergency_shutdown.is_some(),
        }
    }

    /// Emit the final statistics block.
    pub fn log_final(stats: &PerformanceStats) {
        info!(
            balance = format!("${:.2}", stats.portfolio.balance),
            equity = format!("${:.2}", stats.portfolio.total_equity),
            pnl = format!("${:.2}", stats.portfolio.total_pnl),
            pnl_pct = format!("{:.2}%", stats.portfolio.total_pnl_percent),
            trades = stats.total_trades,
            closed = stats.closed_trades,
            win_rate = format!("{:.1}%", stats.win_rate),
            fees = format!("${:.4}", stats.fees_paid),
            gas = format!("${:.4}", stats.gas_paid),
            "Final statistics"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
