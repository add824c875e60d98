//! Engine loop.
//!
//! One task owns the receiving end of a bounded price channel and the
//! [`TradingCore`] mutex. Each event is handled in three steps: adapter
//! lookups (no lock held), one locked decision cycle, then persistence and
//! alert dispatch. Exit checks and status logs run on their own intervals in
//! the same `select!`, so the core never sees two writers.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::{dispatch_all, AlertEvent, Notifier};
use crate::engine::accountant::{Accountant, PerformanceStats};
use crate::engine::{CycleOutcome, EngineCounters, EngineSettings, EngineSnapshot, MarketQuote, TradingCore};
use crate::platforms::OddsProvider;
use crate::storage::{export_json, StateStore, StoredState, DEFAULT_TRADE_RELOAD_LIMIT, RISK_STATE_KEY};
use crate::strategy::risk::RiskState;
use crate::types::{CryptoMarket, LedgerError, PositionKey, PriceUpdate};

/// How long shutdown waits for in-flight notifications.
const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Adapters the engine talks to.
pub struct EngineDeps {
    pub odds: Arc<dyn OddsProvider>,
    pub store: Arc<dyn StateStore>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

/// Cloneable front door: feed prices in, read snapshots out.
#[derive(Clone)]
pub struct EngineHandle {
    core: Arc<Mutex<TradingCore>>,
    tx: mpsc::Sender<PriceUpdate>,
}

impl EngineHandle {
    pub fn price_sender(&self) -> mpsc::Sender<PriceUpdate> {
        self.tx.clone()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.core.lock().await.snapshot(Utc::now())
    }

    /// Shared core for manual risk operations.
    pub fn core(&self) -> Arc<Mutex<TradingCore>> {
        Arc::clone(&self.core)
    }
}

/// What the engine reports once it has shut down.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub stats: PerformanceStats,
    pub counters: EngineCounters,
    pub discarded_events: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    core: Arc<Mutex<TradingCore>>,
    deps: EngineDeps,
    settings: EngineSettings,
    rx: mpsc::Receiver<PriceUpdate>,
    markets: HashMap<String, (Instant, Vec<CryptoMarket>)>,
    last_summary_date: NaiveDate,
    in_flight: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Restore state from the store (or start fresh) and open the price channel.
    ///
    /// Fails when persisted state does not pass integrity checks.
    pub async fn start(settings: EngineSettings, deps: EngineDeps) -> Result<(Self, EngineHandle)> {
        let now = Utc::now();
        let core = restore_core(&settings, deps.store.as_ref()).await?;

        let (tx, rx) = mpsc::channel(settings.engine.channel_capacity.max(1));
        let core = Arc::new(Mutex::new(core));
        let handle = EngineHandle {
            core: Arc::clone(&core),
            tx,
        };

        let engine = Self {
            core,
            deps,
            settings,
            rx,
            markets: HashMap::new(),
            last_summary_date: now.date_naive(),
            in_flight: Vec::new(),
        };
        Ok((engine, handle))
    }

    /// Process events until `shutdown` flips to true or every sender is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<EngineReport> {
        let cfg = &self.settings.engine;
        let mut exit_tick = tokio::time::interval(Duration::from_secs(cfg.exit_check_interval_secs.max(1)));
        exit_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_tick = tokio::time::interval(Duration::from_secs(cfg.status_interval_secs.max(1)));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            name = %cfg.name,
            odds = self.deps.odds.name(),
            store = self.deps.store.name(),
            notifiers = self.deps.notifiers.len(),
            "Engine running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                maybe = self.rx.recv() => match maybe {
                    Some(update) => self.handle_price(update).await,
                    None => {
                        info!("All price senders dropped");
                        break;
                    }
                },
                _ = exit_tick.tick() => self.run_exit_check().await,
                _ = status_tick.tick() => self.log_status().await,
            }
        }

        self.shutdown().await
    }

    // -- Event handlers ---------------------------------------------------

    async fn handle_price(&mut self, update: PriceUpdate) {
        let quotes = self.quotes_for(&update).await;
        let outcome = self.core.lock().await.on_price(&update, &quotes);
        self.apply(outcome).await;
    }

    async fn run_exit_check(&mut self) {
        let keys = self.core.lock().await.open_keys();
        if keys.is_empty() {
            return;
        }
        let prices = self.fetch_prices(&keys).await;
        let outcome = self.core.lock().await.check_exits(&prices, Utc::now());
        self.apply(outcome).await;
    }

    async fn log_status(&mut self) {
        let now = Utc::now();
        let (snapshot, summary) = {
            let core = self.core.lock().await;
            let summary = (now.date_naive() != self.last_summary_date).then(|| {
                let end_of_day = self
                    .last_summary_date
                    .and_hms_opt(23, 59, 59)
                    .map(|d| d.and_utc())
                    .unwrap_or(now);
                Accountant::daily_summary(
                    core.ledger().state_ref(),
                    &core.gate().risk_status(end_of_day),
                    self.last_summary_date,
                )
            });
            (core.snapshot(now), summary)
        };

        let perf = &snapshot.performance;
        info!(
            updates = snapshot.counters.price_updates,
            opportunities = snapshot.counters.opportunities,
            opened = snapshot.counters.positions_opened,
            open = perf.open_positions,
            trades = perf.total_trades,
            win_rate = format!("{:.1}%", perf.win_rate),
            pnl = format!("${:.2}", perf.total_realized_pnl),
            equity = format!("${:.2}", perf.portfolio.total_equity),
            halted = snapshot.risk.trading_halted,
            "Status"
        );

        if let Some(summary) = summary {
            info!(summary = %summary, "Daily summary");
            self.last_summary_date = now.date_naive();
            let handles = dispatch_all(&self.deps.notifiers, &AlertEvent::DailySummary(summary));
            self.in_flight.extend(handles);
        }
    }

    // -- Adapter lookups (no lock held) -----------------------------------

    async fn markets_for(&mut self, asset: &str) -> Vec<CryptoMarket> {
        let ttl = Duration::from_secs(self.settings.engine.market_refresh_secs);
        if let Some((fetched_at, markets)) = self.markets.get(asset) {
            if fetched_at.elapsed() < ttl {
                return markets.clone();
            }
        }

        let timeframe = self.settings.engine.timeframe.clone();
        match self.deps.odds.crypto_markets(asset, &timeframe).await {
            Ok(markets) => {
                debug!(asset, count = markets.len(), "Market list refreshed");
                self.markets.insert(asset.to_string(), (Instant::now(), markets.clone()));
                markets
            }
            Err(e) => {
                warn!(asset, error = %e, "Market lookup failed, no signal this cycle");
                self.markets.get(asset).map(|(_, m)| m.clone()).unwrap_or_default()
            }
        }
    }

    async fn quotes_for(&mut self, update: &PriceUpdate) -> Vec<MarketQuote> {
        let asset = update.asset().to_uppercase();
        let markets = self.markets_for(&asset).await;
        if markets.is_empty() {
            return Vec::new();
        }

        let odds = Arc::clone(&self.deps.odds);
        let results = join_all(markets.iter().map(|m| odds.market_odds(&m.id))).await;

        markets
            .into_iter()
            .zip(results)
            .filter_map(|(market, result)| match result {
                Ok(Some(odds)) => Some(MarketQuote { market, odds }),
                Ok(None) => None,
                Err(e) => {
                    warn!(market_id = %market.id, error = %e, "Odds lookup failed");
                    None
                }
            })
            .collect()
    }

    /// Current outcome prices for the given positions. Missing entries mean
    /// the venue had nothing usable.
    async fn fetch_prices(&self, keys: &[PositionKey]) -> HashMap<PositionKey, Decimal> {
        let market_ids: Vec<&str> = keys
            .iter()
            .map(|k| k.market_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let results = join_all(market_ids.iter().map(|id| self.deps.odds.market_odds(id))).await;

        let mut odds_by_market = HashMap::new();
        for (id, result) in market_ids.into_iter().zip(results) {
            match result {
                Ok(Some(odds)) => {
                    odds_by_market.insert(id, odds);
                }
                Ok(None) => debug!(market_id = id, "No odds for open position"),
                Err(e) => warn!(market_id = id, error = %e, "Odds lookup failed"),
            }
        }

        keys.iter()
            .filter_map(|k| {
                let odds = odds_by_market.get(k.market_id.as_str())?;
                Some((k.clone(), odds.price_for(&k.outcome)?))
            })
            .collect()
    }

    // -- Side effects -----------------------------------------------------

    async fn apply(&mut self, outcome: CycleOutcome) {
        if outcome.is_empty() {
            return;
        }
        self.persist(&outcome).await;

        for alert in &outcome.alerts {
            self.in_flight.extend(dispatch_all(&self.deps.notifiers, alert));
        }
        self.in_flight.retain(|h| !h.is_finished());
    }

    async fn persist(&self, outcome: &CycleOutcome) {
        let store = &self.deps.store;
        for fill in &outcome.fills {
            if let Err(e) = store.save_trade(&fill.trade).await {
                error!(trade_id = %fill.trade.id, error = %e, "Failed to persist trade");
            }
            if let Err(e) = store.save_position(&fill.position).await {
                error!(position_id = %fill.position.id, error = %e, "Failed to persist position");
            }
        }
        if !outcome.fills.is_empty() {
            if let Err(e) = store.save_balance(outcome.initial_balance, outcome.balance).await {
                error!(error = %e, "Failed to persist balance");
            }
        }
        if let Some(json) = &outcome.risk_state {
            if let Err(e) = store.set_state(RISK_STATE_KEY, json).await {
                error!(error = %e, "Failed to persist risk state");
            }
        }
    }

    // -- Shutdown ---------------------------------------------------------

    async fn shutdown(mut self) -> Result<EngineReport> {
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarded buffered price events");
        }

        let keys = self.core.lock().await.open_keys();
        if !keys.is_empty() {
            let prices = self.fetch_prices(&keys).await;
            let outcome = self.core.lock().await.close_all(&prices, Utc::now());
            info!(
                open = keys.len(),
                closed = outcome.fills.len(),
                quoted = prices.len(),
                "Open positions force-closed"
            );
            self.apply(outcome).await;
        }

        let now = Utc::now();
        let (state, risk_json, summary, stats, counters) = {
            let core = self.core.lock().await;
            let state = core.ledger().state();
            let summary = Accountant::daily_summary(&state, &core.gate().risk_status(now), now.date_naive());
            let stats = Accountant::performance_stats(&state, now.date_naive());
            (state, core.risk_state_json(), summary, stats, core.counters())
        };

        let store = &self.deps.store;
        store
            .save_balance(state.initial_balance, state.balance)
            .await
            .context("Failed to persist final balance")?;
        if let Some(json) = risk_json {
            store
                .set_state(RISK_STATE_KEY, &json)
                .await
                .context("Failed to persist final risk state")?;
        }

        self.in_flight
            .extend(dispatch_all(&self.deps.notifiers, &AlertEvent::DailySummary(summary)));
        for handle in self.in_flight.drain(..) {
            if tokio::time::timeout(ALERT_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Notification still pending at shutdown, dropping it");
            }
        }

        Accountant::log_final(&stats);
        if let Some(path) = &self.settings.export_path {
            if let Err(e) = export_json(path, &state, &stats) {
                error!(path = %path, error = %e, "Export failed");
            }
        }

        Ok(EngineReport {
            stats,
            counters,
            discarded_events: discarded,
        })
    }
}

/// Rebuild the core from persisted state, or start fresh when the store is empty.
async fn restore_core(settings: &EngineSettings, store: &dyn StateStore) -> Result<TradingCore> {
    let now = Utc::now();
    let stored = store
        .load_state(DEFAULT_TRADE_RELOAD_LIMIT)
        .await
        .context("Failed to load ledger state")?;

    let risk_state = match store.get_state(RISK_STATE_KEY).await.context("Failed to load risk state")? {
        Some(json) => Some(
            serde_json::from_str::<RiskState>(&json)
                .map_err(|e| LedgerError::CorruptState(format!("unreadable risk state: {e}")))?,
        ),
        None => None,
    };

    let fresh = stored.is_none();
    let ledger_state = stored.map(StoredState::into_ledger_state);
    if let Some(state) = &ledger_state {
        info!(
            balance = format!("${:.2}", state.balance),
            open_positions = state.positions.len(),
            trades = state.trades.len(),
            "Resumed from saved state"
        );
    }

    let core = TradingCore::build(settings, ledger_state, risk_state, now)?;

    if fresh {
        info!(
            balance = format!("${:.2}", core.ledger().balance()),
            "Fresh start"
        );
        store
            .save_balance(core.ledger().initial_balance(), core.ledger().balance())
            .await
            .context("Failed to persist initial balance")?;
    }
    Ok(core)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
