//! Position ledger: the system of record for the paper account.
//!
//! Holds the cash balance, open positions keyed by [`PositionKey`], closed
//! position history and the append-only trade log. Every balance change is
//! produced by exactly one [`TradeRecord`].

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{info, warn};

use crate::engine::costs::ExecutionCosts;
use crate::types::{
    CloseReason, Direction, LedgerError, Position, PositionKey, PositionSide, PositionStatus,
    TradeRecord, TradeSide,
};

/// A sell covering at least this fraction of the held shares closes the position.
const FULL_CLOSE_FRACTION: Decimal = dec!(0.999);

// ---------------------------------------------------------------------------
// Requests & results
// ---------------------------------------------------------------------------

/// One order against the ledger.
#[derive(Debug, Clone)]
pub struct FillRequest {
    pub key: PositionKey,
    pub side: TradeSide,
    pub shares: Decimal,
    pub quoted_price: Decimal,
    /// Only consulted when a BUY creates a new position.
    pub symbol: String,
    pub direction: Direction,
    pub position_side: PositionSide,
    pub source_id: String,
    /// Recorded on the trade and position when a SELL closes it.
    pub close_reason: Option<CloseReason>,
    pub timestamp: DateTime<Utc>,
}

impl FillRequest {
    /// A long BUY of `shares` outcome tokens.
    pub fn buy(
        key: PositionKey,
        symbol: impl Into<String>,
        direction: Direction,
        source_id: impl Into<String>,
        shares: Decimal,
        quoted_price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            side: TradeSide::Buy,
            shares,
            quoted_price,
            symbol: symbol.into(),
            direction,
            position_side: PositionSide::Long,
            source_id: source_id.into(),
            close_reason: None,
            timestamp,
        }
    }

    /// A SELL against an existing position; identity fields come from the position.
    pub fn sell(
        key: PositionKey,
        shares: Decimal,
        quoted_price: Decimal,
        reason: CloseReason,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            side: TradeSide::Sell,
            shares,
            quoted_price,
            symbol: String::new(),
            direction: Direction::Up,
            position_side: PositionSide::Long,
            source_id: String::new(),
            close_reason: Some(reason),
            timestamp,
        }
    }

    pub fn with_position_side(mut self, side: PositionSide) -> Self {
        self.position_side = side;
        self
    }
}

/// Outcome of a successful fill.
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade: TradeRecord,
    /// Position after the fill (terminal snapshot when `closed`).
    pub position: Position,
    pub closed: bool,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Snapshot of everything the ledger owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    #[serde(with = "positions_as_list")]
    pub positions: BTreeMap<PositionKey, Position>,
    /// Oldest first.
    pub closed_positions: Vec<Position>,
    /// Newest first.
    pub trades: VecDeque<TradeRecord>,
}

impl LedgerState {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            positions: BTreeMap::new(),
            closed_positions: Vec::new(),
            trades: VecDeque::new(),
        }
    }

    /// Fills that closed a position, newest first.
    pub fn closing_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter().filter(|t| t.is_close())
    }

    /// Every sell, including partial reductions, newest first.
    pub fn realized_trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trades.iter().filter(|t| t.is_realized())
    }

    /// Realized PnL of all sells on the given UTC date.
    pub fn realized_pnl_on(&self, date: NaiveDate) -> Decimal {
        self.realized_trades()
            .filter(|t| t.timestamp.date_naive() == date)
            .filter_map(|t| t.realized_pnl)
            .sum()
    }
}

/// JSON objects need string keys; positions carry their own key, so store a list.
mod positions_as_list {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        positions: &BTreeMap<PositionKey, Position>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(positions.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PositionKey, Position>, D::Error> {
        let list = Vec::<Position>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|p| (p.key.clone(), p)).collect())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Ledger {
    state: LedgerState,
    costs: ExecutionCosts,
}

impl Ledger {
    pub fn new(initial_balance: Decimal, costs: ExecutionCosts) -> Self {
        Self {
            state: LedgerState::new(initial_balance),
            costs,
        }
    }

    /// Rebuild from persisted state, refusing anything inconsistent.
    pub fn from_state(state: LedgerState, costs: ExecutionCosts) -> Result<Self, LedgerError> {
        validate_state(&state)?;
        info!(
            balance = format!("${:.2}", state.balance),
            open_positions = state.positions.len(),
            trades = state.trades.len(),
            "Ledger restored"
        );
        Ok(Self { state, costs })
    }

    pub fn balance(&self) -> Decimal {
        self.state.balance
    }

    pub fn initial_balance(&self) -> Decimal {
        self.state.initial_balance
    }

    pub fn costs(&self) -> &ExecutionCosts {
        &self.costs
    }

    pub fn positions(&self) -> Vec<&Position> {
        self.state.positions.values().collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.state.positions.len()
    }

    pub fn position(&self, key: &PositionKey) -> Option<&Position> {
        self.state.positions.get(key)
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.state.closed_positions
    }

    /// Trades newest first, optionally filtered by market id.
    pub fn trade_history(&self, limit: usize, offset: usize, market_id: Option<&str>) -> Vec<&TradeRecord> {
        self.state
            .trades
            .iter()
            .filter(|t| market_id.map_or(true, |m| t.key.market_id == m))
            .skip(offset)
            .take(limit)
            .collect()
    }

    /// Owned copy of the full ledger state.
    pub fn state(&self) -> LedgerState {
        self.state.clone()
    }

    /// Borrowed view for read-only analytics.
    pub fn state_ref(&self) -> &LedgerState {
        &self.state
    }

    /// Update marks and unrealized PnL. Returns how many positions were marked.
    pub fn mark_prices(&mut self, prices: &HashMap<PositionKey, Decimal>) -> usize {
        let mut marked = 0;
        for (key, price) in prices {
            if let Some(pos) = self.state.positions.get_mut(key) {
                pos.mark(*price);
                marked += 1;
            }
        }
        marked
    }

    /// Wipe all positions and history back to the initial balance.
    pub fn reset(&mut self, confirm: bool) -> Result<(), LedgerError> {
        if !confirm {
            return Err(LedgerError::ResetNotConfirmed);
        }
        warn!(
            balance = format!("${:.2}", self.state.balance),
            open_positions = self.state.positions.len(),
            "Ledger reset"
        );
        self.state = LedgerState::new(self.state.initial_balance);
        Ok(())
    }

    /// Execute a simulated fill.
    pub fn execute(&mut self, req: FillRequest) -> Result<Fill, LedgerError> {
        if req.shares <= Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!(
                "shares must be positive, got {}",
                req.shares
            )));
        }
        // Resolved markets settle at exactly 0 or 1; only exits may trade there.
        let price_ok = match req.side {
            TradeSide::Buy => req.quoted_price > Decimal::ZERO && req.quoted_price < Decimal::ONE,
            TradeSide::Sell => req.quoted_price >= Decimal::ZERO && req.quoted_price <= Decimal::ONE,
        };
        if !price_ok {
            let range = match req.side {
                TradeSide::Buy => "(0, 1)",
                TradeSide::Sell => "[0, 1]",
            };
            return Err(LedgerError::InvalidOrder(format!(
                "{} price must be within {range}, got {}",
                req.side, req.quoted_price
            )));
        }

        match req.side {
            TradeSide::Buy => self.buy(req),
            TradeSide::Sell => self.sell(req),
        }
    }

    fn buy(&mut self, req: FillRequest) -> Result<Fill, LedgerError> {
        let pricing = self.costs.price_fill(TradeSide::Buy, req.shares, req.quoted_price);

        if pricing.total_cost > self.state.balance {
            return Err(LedgerError::InsufficientBalance {
                needed: pricing.total_cost,
                available: self.state.balance,
            });
        }

        let position = match self.state.positions.get_mut(&req.key) {
            Some(pos) => {
                let total_shares = pos.shares + req.shares;
                pos.entry_price =
                    (pos.entry_price * pos.shares + pricing.executed_price * req.shares) / total_shares;
                pos.shares = total_shares;
                pos.cost_basis += pricing.total_cost;
                pos.clone()
            }
            None => {
                let pos = Position {
                    id: uuid::Uuid::new_v4().to_string(),
                    symbol: req.symbol.clone(),
                    key: req.key.clone(),
                    direction: req.direction,
                    side: req.position_side,
                    source_id: req.source_id.clone(),
                    shares: req.shares,
                    entry_price: pricing.executed_price,
                    cost_basis: pricing.total_cost,
                    current_price: None,
                    realized_pnl: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                    opened_at: req.timestamp,
                    closed_at: None,
                    close_reason: None,
                    status: PositionStatus::Open,
                };
                self.state.positions.insert(req.key.clone(), pos.clone());
                pos
            }
        };

        self.state.balance -= pricing.total_cost;

        let trade = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: req.timestamp,
            source_id: position.source_id.clone(),
            position_id: position.id.clone(),
            key: req.key,
            side: TradeSide::Buy,
            shares: req.shares,
            price: pricing.executed_price,
            quoted_price: pricing.quoted_price,
            slippage: pricing.slippage,
            amount: pricing.amount,
            fees: pricing.fees,
            gas_cost: pricing.gas_cost,
            total_cost: pricing.total_cost,
            balance_after: self.state.balance,
            realized_pnl: None,
            realized_pnl_percent: None,
            close_reason: None,
        };

        info!(
            key = %trade.key,
            shares = format!("{:.4}", trade.shares),
            price = format!("{:.4}", trade.price),
            cost = format!("${:.2}", trade.total_cost),
            balance = format!("${:.2}", self.state.balance),
            "Paper BUY executed"
        );

        self.state.trades.push_front(trade.clone());
        Ok(Fill {
            trade,
            position,
            closed: false,
        })
    }

    fn sell(&mut self, req: FillRequest) -> Result<Fill, LedgerError> {
        let held = match self.state.positions.get(&req.key) {
            Some(pos) => pos.shares,
            None => return Err(LedgerError::NoSuchPosition(req.key)),
        };
        if req.shares > held {
            return Err(LedgerError::InsufficientShares {
                requested: req.shares,
                held,
            });
        }

        let closes = req.shares >= held * FULL_CLOSE_FRACTION;
        let shares = if closes { held } else { req.shares };
        let mut pricing = self.costs.price_fill(TradeSide::Sell, shares, req.quoted_price);
        // Gas never takes more than the sale returns.
        let gas_cap = (pricing.amount - pricing.fees).max(Decimal::ZERO);
        if pricing.gas_cost > gas_cap {
            pricing.gas_cost = gas_cap;
            pricing.total_cost = pricing.amount + pricing.fees + pricing.gas_cost;
        }

        let Some(pos) = self.state.positions.get_mut(&req.key) else {
            return Err(LedgerError::NoSuchPosition(req.key));
        };

        let exec = pricing.executed_price;
        let gross = match pos.side {
            PositionSide::Long => (exec - pos.entry_price) * shares,
            PositionSide::Short => (pos.entry_price - exec) * shares,
        };
        let realized_pnl = gross - pricing.fees - pricing.gas_cost;
        let realized_pnl_percent = match pos.side {
            PositionSide::Long => (exec / pos.entry_price - Decimal::ONE) * dec!(100),
            PositionSide::Short => (pos.entry_price - exec) / pos.entry_price * dec!(100),
        };

        pos.realized_pnl += realized_pnl;
        let remaining = pos.shares - shares;
        pos.cost_basis = if remaining > Decimal::ZERO {
            pos.cost_basis * remaining / pos.shares
        } else {
            Decimal::ZERO
        };

        let proceeds = pricing.amount - pricing.fees - pricing.gas_cost;
        self.state.balance += proceeds;

        let reason = req.close_reason.unwrap_or(CloseReason::Manual);
        let position = if closes {
            let mut closed = self
                .state
                .positions
                .remove(&req.key)
                .ok_or_else(|| LedgerError::NoSuchPosition(req.key.clone()))?;
            closed.status = PositionStatus::Closed;
            closed.closed_at = Some(req.timestamp);
            closed.close_reason = Some(reason);
            closed.current_price = Some(exec);
            closed.unrealized_pnl = Decimal::ZERO;
            self.state.closed_positions.push(closed.clone());
            closed
        } else {
            pos.shares = remaining;
            pos.mark(exec);
            pos.clone()
        };

        let trade = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: req.timestamp,
            source_id: position.source_id.clone(),
            position_id: position.id.clone(),
            key: req.key,
            side: TradeSide::Sell,
            shares,
            price: exec,
            quoted_price: pricing.quoted_price,
            slippage: pricing.slippage,
            amount: pricing.amount,
            fees: pricing.fees,
            gas_cost: pricing.gas_cost,
            total_cost: pricing.total_cost,
            balance_after: self.state.balance,
            realized_pnl: Some(realized_pnl),
            realized_pnl_percent: Some(realized_pnl_percent),
            close_reason: closes.then_some(reason),
        };

        info!(
            key = %trade.key,
            shares = format!("{:.4}", shares),
            price = format!("{:.4}", exec),
            pnl = format!("${:.2}", realized_pnl),
            closed = closes,
            balance = format!("${:.2}", self.state.balance),
            "Paper SELL executed"
        );

        self.state.trades.push_front(trade.clone());
        Ok(Fill {
            trade,
            position,
            closed: closes,
        })
    }
}

/// Integrity checks applied to restored state.
fn validate_state(state: &LedgerState) -> Result<(), LedgerError> {
    if state.balance < Decimal::ZERO {
        return Err(LedgerError::CorruptState(format!(
            "negative balance {}",
            state.balance
        )));
    }

    for (key, pos) in &state.positions {
        if &pos.key != key {
            return Err(LedgerError::CorruptState(format!(
                "position {} stored under key {key}",
                pos.key
            )));
        }
        if pos.shares <= Decimal::ZERO {
            return Err(LedgerError::CorruptState(format!(
                "position {key} has non-positive shares {}",
                pos.shares
            )));
        }
        if pos.entry_price <= Decimal::ZERO {
            return Err(LedgerError::CorruptState(format!(
                "position {key} has non-positive entry price {}",
                pos.entry_price
            )));
        }
        if pos.status != PositionStatus::Open {
            return Err(LedgerError::CorruptState(format!(
                "position {key} is marked closed but still open"
            )));
        }
    }

    let closed_ids: HashSet<&str> = state.closed_positions.iter().map(|p| p.id.as_str()).collect();
    if let Some(pos) = state.positions.values().find(|p| closed_ids.contains(p.id.as_str())) {
        return Err(LedgerError::CorruptState(format!(
            "position {} is both open and closed",
            pos.id
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::costs::CostConfig;
    use chrono::Duration;

    fn make_ledger(balance: Decimal) -> Ledger {
        Ledger::new(balance, ExecutionCosts::fixed(CostConfig::default(), dec!(0.01)))
    }

    fn buy(key: &PositionKey, shares: Decimal, price: Decimal) -> FillRequest {
        FillRequest::buy(
            key.clone(),
            "BTC/USDT",
            Direction::Up,
            "binance:BTC/USDT",
            shares,
            price,
            Utc::now(),
        )
    }

    fn sell(key: &PositionKey, shares: Decimal, price: Decimal) -> FillRequest {
        FillRequest::sell(key.clone(), shares, price, CloseReason::TakeProfit, Utc::now())
    }

    #[test]
    fn test_buy_debits_exact_total_cost() {
        let mut ledger = make_ledger(dec!(10000));
        let key = PositionKey::new("abc", "Yes");

        let fill = ledger.execute(buy(&key, dec!(1000), dec!(0.65))).unwrap();

        assert_eq!(fill.trade.price, dec!(0.6565));
        assert_eq!(fill.trade.amount, dec!(656.5));
        assert_eq!(fill.trade.fees, dec!(1.313));
        assert_eq!(fill.trade.total_cost, dec!(657.818));
        assert_eq!(ledger.balance(), dec!(9342.182));
        assert_eq!(fill.trade.balance_after, dec!(9342.182));
        assert!(!fill.closed);

        let pos = ledger.position(&key).unwrap();
        assert_eq!(pos.shares, dec!(1000));
        assert_eq!(pos.entry_price, dec!(0.6565));
        assert_eq!(pos.cost_basis, dec!(657.818));
    }

    #[test]
    fn test_sell_all_closes_with_profit() {
        let mut ledger = make_ledger(dec!(10000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(1000), dec!(0.65))).unwrap();

        let fill = ledger.execute(sell(&key, dec!(1000), dec!(0.75))).unwrap();

        assert!(fill.closed);
        // (0.7425 - 0.6565) * 1000 - 1.485 fees - 0.005 gas
        assert_eq!(fill.trade.realized_pnl, Some(dec!(84.51)));
        assert_eq!(fill.trade.close_reason, Some(CloseReason::TakeProfit));
        assert!(ledger.position(&key).is_none());
        assert_eq!(ledger.closed_positions().len(), 1);
        assert_eq!(ledger.closed_positions()[0].status, PositionStatus::Closed);
        assert_eq!(ledger.balance(), dec!(9342.182) + dec!(742.5) - dec!(1.485) - dec!(0.005));
    }

    #[test]
    fn test_insufficient_balance_rejected_without_mutation() {
        let mut ledger = make_ledger(dec!(100));
        let key = PositionKey::new("abc", "Yes");

        let err = ledger.execute(buy(&key, dec!(1000), dec!(0.65))).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance(), dec!(100));
        assert!(ledger.positions().is_empty());
        assert!(ledger.trade_history(10, 0, None).is_empty());
    }

    #[test]
    fn test_buy_into_existing_position_averages() {
        let mut ledger = Ledger::new(dec!(10000), ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(100), dec!(0.40))).unwrap();
        let fill = ledger.execute(buy(&key, dec!(100), dec!(0.60))).unwrap();

        assert_eq!(fill.position.shares, dec!(200));
        assert_eq!(fill.position.entry_price, dec!(0.50));
        assert_eq!(ledger.positions().len(), 1);
    }

    #[test]
    fn test_partial_sell_reduces_in_place() {
        let mut ledger = make_ledger(dec!(10000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(1000), dec!(0.50))).unwrap();

        let fill = ledger.execute(sell(&key, dec!(400), dec!(0.55))).unwrap();

        assert!(!fill.closed);
        assert!(fill.trade.close_reason.is_none());
        let pos = ledger.position(&key).unwrap();
        assert_eq!(pos.shares, dec!(600));
        assert!(pos.is_open());
        assert!(ledger.closed_positions().is_empty());
    }

    #[test]
    fn test_sell_within_tolerance_closes_whole_position() {
        let mut ledger = make_ledger(dec!(10000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(1000), dec!(0.50))).unwrap();

        let fill = ledger.execute(sell(&key, dec!(999.5), dec!(0.50))).unwrap();

        assert!(fill.closed);
        assert_eq!(fill.trade.shares, dec!(1000));
        assert!(ledger.position(&key).is_none());
    }

    #[test]
    fn test_sell_without_position() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("missing", "Yes");
        let err = ledger.execute(sell(&key, dec!(1), dec!(0.5))).unwrap_err();
        assert_eq!(err, LedgerError::NoSuchPosition(key));
    }

    #[test]
    fn test_sell_more_than_held() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();

        let err = ledger.execute(sell(&key, dec!(11), dec!(0.5))).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { .. }));
        assert_eq!(ledger.position(&key).unwrap().shares, dec!(10));
    }

    #[test]
    fn test_invalid_orders_rejected() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");

        for (shares, price) in [
            (dec!(0), dec!(0.5)),
            (dec!(-5), dec!(0.5)),
            (dec!(10), dec!(0)),
            (dec!(10), dec!(1)),
            (dec!(10), dec!(1.2)),
        ] {
            let err = ledger.execute(buy(&key, shares, price)).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidOrder(_)), "{shares} @ {price}");
        }
        assert_eq!(ledger.balance(), dec!(1000));
    }

    #[test]
    fn test_balance_conservation_over_sequence() {
        let mut ledger = Ledger::new(
            dec!(5000),
            ExecutionCosts::uniform(CostConfig::default(), Some(11)),
        );
        let a = PositionKey::new("m1", "Yes");
        let b = PositionKey::new("m2", "No");

        ledger.execute(buy(&a, dec!(300), dec!(0.42))).unwrap();
        ledger.execute(buy(&b, dec!(150), dec!(0.77))).unwrap();
        ledger.execute(buy(&a, dec!(100), dec!(0.45))).unwrap();
        ledger.execute(sell(&a, dec!(200), dec!(0.51))).unwrap();
        ledger.execute(sell(&b, dec!(150), dec!(0.60))).unwrap();
        ledger.execute(sell(&a, dec!(200), dec!(0.38))).unwrap();

        let expected: Decimal = dec!(5000)
            + ledger
                .trade_history(usize::MAX, 0, None)
                .iter()
                .map(|t| t.balance_delta())
                .sum::<Decimal>();
        assert_eq!(ledger.balance(), expected);
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.closed_positions().len(), 2);

        // Each record's balance_after chains from the previous one.
        let trades: Vec<_> = ledger.trade_history(usize::MAX, 0, None).into_iter().rev().collect();
        let mut running = dec!(5000);
        for t in trades {
            running += t.balance_delta();
            assert_eq!(t.balance_after, running);
        }
    }

    #[test]
    fn test_trade_history_filter_and_paging() {
        let mut ledger = make_ledger(dec!(10000));
        let a = PositionKey::new("m1", "Yes");
        let b = PositionKey::new("m2", "Yes");
        ledger.execute(buy(&a, dec!(10), dec!(0.5))).unwrap();
        ledger.execute(buy(&b, dec!(10), dec!(0.5))).unwrap();
        ledger.execute(buy(&a, dec!(20), dec!(0.5))).unwrap();

        let all = ledger.trade_history(10, 0, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].shares, dec!(20));

        let m1 = ledger.trade_history(10, 0, Some("m1"));
        assert_eq!(m1.len(), 2);

        let paged = ledger.trade_history(1, 1, None);
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].key, b);
    }

    #[test]
    fn test_mark_prices_updates_unrealized() {
        let mut ledger = Ledger::new(dec!(1000), ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(100), dec!(0.50))).unwrap();

        let mut prices = HashMap::new();
        prices.insert(key.clone(), dec!(0.60));
        prices.insert(PositionKey::new("other", "Yes"), dec!(0.10));
        assert_eq!(ledger.mark_prices(&prices), 1);

        let pos = ledger.position(&key).unwrap();
        assert_eq!(pos.current_price, Some(dec!(0.60)));
        assert_eq!(pos.unrealized_pnl, dec!(10));
    }

    #[test]
    fn test_reset_requires_confirmation() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();

        assert_eq!(ledger.reset(false), Err(LedgerError::ResetNotConfirmed));
        assert_eq!(ledger.positions().len(), 1);

        ledger.reset(true).unwrap();
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.balance(), dec!(1000));
        assert!(ledger.trade_history(10, 0, None).is_empty());
    }

    #[test]
    fn test_from_state_roundtrip() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();

        let restored = Ledger::from_state(ledger.state(), ExecutionCosts::fixed(CostConfig::default(), dec!(0.01))).unwrap();
        assert_eq!(restored.balance(), ledger.balance());
        assert_eq!(restored.positions().len(), 1);
    }

    #[test]
    fn test_from_state_rejects_corruption() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();
        let good = ledger.state();
        let costs = || ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO);

        let mut negative = good.clone();
        negative.balance = dec!(-1);
        assert!(matches!(Ledger::from_state(negative, costs()), Err(LedgerError::CorruptState(_))));

        let mut zero_shares = good.clone();
        zero_shares.positions.get_mut(&key).unwrap().shares = Decimal::ZERO;
        assert!(matches!(Ledger::from_state(zero_shares, costs()), Err(LedgerError::CorruptState(_))));

        let mut both = good.clone();
        let dup = both.positions[&key].clone();
        both.closed_positions.push(dup);
        assert!(matches!(Ledger::from_state(both, costs()), Err(LedgerError::CorruptState(_))));

        let mut wrong_key = good;
        let pos = wrong_key.positions.remove(&key).unwrap();
        wrong_key.positions.insert(PositionKey::new("xyz", "No"), pos);
        assert!(matches!(Ledger::from_state(wrong_key, costs()), Err(LedgerError::CorruptState(_))));
    }

    #[test]
    fn test_short_position_pnl_sign() {
        let mut ledger = Ledger::new(dec!(1000), ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO));
        let key = PositionKey::new("abc", "No");
        ledger
            .execute(buy(&key, dec!(100), dec!(0.60)).with_position_side(PositionSide::Short))
            .unwrap();
        let fill = ledger.execute(sell(&key, dec!(100), dec!(0.50))).unwrap();

        // (0.60 - 0.50) * 100 - 0.10 fee - 0.005 gas
        assert_eq!(fill.trade.realized_pnl, Some(dec!(9.895)));
    }

    #[test]
    fn test_sell_settles_at_resolved_prices() {
        let mut ledger = make_ledger(dec!(1000));
        let win = PositionKey::new("won", "Yes");
        let lose = PositionKey::new("lost", "Yes");
        ledger.execute(buy(&win, dec!(100), dec!(0.5))).unwrap();
        ledger.execute(buy(&lose, dec!(100), dec!(0.5))).unwrap();

        let fill = ledger.execute(sell(&win, dec!(100), Decimal::ONE)).unwrap();
        assert!(fill.closed);
        assert_eq!(fill.trade.quoted_price, Decimal::ONE);
        assert_eq!(fill.trade.price, dec!(0.99));
        assert!(fill.trade.realized_pnl.unwrap() > Decimal::ZERO);

        let fill = ledger.execute(sell(&lose, dec!(100), Decimal::ZERO)).unwrap();
        assert!(fill.closed);
        assert_eq!(fill.trade.price, Decimal::ZERO);
        assert_eq!(fill.trade.amount, Decimal::ZERO);
        assert_eq!(fill.trade.gas_cost, Decimal::ZERO);
        assert_eq!(fill.trade.realized_pnl, Some(dec!(-50.5)));
        assert_eq!(fill.trade.realized_pnl_percent, Some(dec!(-100)));

        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.closed_positions().len(), 2);
        assert!(ledger.balance() >= Decimal::ZERO);
    }

    #[test]
    fn test_sell_rejects_price_outside_unit_range() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();

        for price in [dec!(-0.1), dec!(1.01)] {
            let err = ledger.execute(sell(&key, dec!(10), price)).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidOrder(_)), "sell @ {price}");
        }
        assert_eq!(ledger.position(&key).unwrap().shares, dec!(10));
    }

    #[test]
    fn test_gas_capped_so_sell_never_overdraws() {
        let costs = || ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO);
        let mut ledger = Ledger::new(dec!(0.51), costs());
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(1), dec!(0.5))).unwrap();
        assert!(ledger.balance() < dec!(0.005));

        let fill = ledger.execute(sell(&key, dec!(1), dec!(0.001))).unwrap();

        assert!(fill.closed);
        assert_eq!(fill.trade.gas_cost, fill.trade.amount - fill.trade.fees);
        assert!(ledger.balance() >= Decimal::ZERO);
        assert_eq!(fill.trade.balance_after, ledger.balance());
        assert!(Ledger::from_state(ledger.state_ref().clone(), costs()).is_ok());
    }

    #[test]
    fn test_short_pnl_percent_at_zero_exit() {
        let mut ledger = Ledger::new(dec!(1000), ExecutionCosts::fixed(CostConfig::default(), Decimal::ZERO));
        let key = PositionKey::new("abc", "No");
        ledger
            .execute(buy(&key, dec!(100), dec!(0.40)).with_position_side(PositionSide::Short))
            .unwrap();
        let fill = ledger.execute(sell(&key, dec!(100), Decimal::ZERO)).unwrap();

        assert_eq!(fill.trade.realized_pnl_percent, Some(dec!(100)));
    }

    #[test]
    fn test_realized_pnl_on_date() {
        let mut ledger = make_ledger(dec!(10000));
        let key = PositionKey::new("abc", "Yes");
        let now = Utc::now();
        ledger.execute(buy(&key, dec!(100), dec!(0.5))).unwrap();
        let fill = ledger.execute(sell(&key, dec!(100), dec!(0.6))).unwrap();
        let pnl = fill.trade.realized_pnl.unwrap();

        let state = ledger.state_ref();
        assert_eq!(state.realized_pnl_on(fill.trade.timestamp.date_naive()), pnl);
        let yesterday = (now - Duration::days(2)).date_naive();
        assert_eq!(state.realized_pnl_on(yesterday), Decimal::ZERO);
    }

    #[test]
    fn test_state_json_roundtrip_keeps_keys() {
        let mut ledger = make_ledger(dec!(1000));
        let key = PositionKey::new("abc", "Yes");
        ledger.execute(buy(&key, dec!(10), dec!(0.5))).unwrap();

        let json = serde_json::to_string(&ledger.state()).unwrap();
        let back: LedgerState = serde_json::from_str(&json).unwrap();
        assert!(back.positions.contains_key(&key));
    }
}
