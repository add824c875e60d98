//! End-to-end scenarios.
//!
//! Drives the trading core directly with explicit timestamps for the risk
//! lifecycle, and the full engine task (channel, adapters, store, alerts)
//! for the live paths.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_test::assert_ok;

use spikegate::alerts::{AlertEvent, Notifier};
use spikegate::engine::costs::CostConfig;
use spikegate::engine::runner::{Engine, EngineDeps, EngineHandle};
use spikegate::engine::{EngineConfig, EngineSettings, MarketQuote, TradingCore};
use spikegate::platforms::paper::{PaperConfig, PaperMarkets, PaperPriceFeed};
use spikegate::platforms::OddsProvider;
use spikegate::storage::{self, MemoryStore, StateStore, StorageConfig, RISK_STATE_KEY};
use spikegate::strategy::risk::RiskConfig;
use spikegate::types::{CloseReason, MarketOdds, PositionKey, PriceUpdate};

use crate::mock_odds::{make_market, RecordingNotifier, ScriptedOdds};

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn zero_slippage() -> CostConfig {
    CostConfig {
        slippage_min: Decimal::ZERO,
        slippage_max: Decimal::ZERO,
        ..Default::default()
    }
}

fn make_settings() -> EngineSettings {
    EngineSettings {
        engine: EngineConfig {
            trade_size: dec!(200),
            exit_check_interval_secs: 1,
            status_interval_secs: 3600,
            seed: Some(7),
            ..Default::default()
        },
        costs: zero_slippage(),
        ..Default::default()
    }
}

fn quote(id: &str, yes: Decimal) -> MarketQuote {
    MarketQuote {
        market: make_market(id, "BTC"),
        odds: MarketOdds::from_yes(yes),
    }
}

/// Baseline tick at `at`, then a 10% jump five seconds later.
fn spike(core: &mut TradingCore, from: Decimal, at: DateTime<Utc>, quotes: &[MarketQuote]) -> Vec<AlertEvent> {
    core.on_price(&PriceUpdate::new("BTC/USDT", from, at), quotes);
    core.on_price(
        &PriceUpdate::new("BTC/USDT", from * dec!(1.1), at + Duration::seconds(5)),
        quotes,
    )
    .alerts
}

// ---------------------------------------------------------------------------
// Risk lifecycle on the core
// ---------------------------------------------------------------------------

#[test]
fn test_daily_loss_halts_then_resumes_next_day() {
    let settings = EngineSettings {
        risk: RiskConfig {
            daily_loss_limit_percent: dec!(0.1),
            ..Default::default()
        },
        ..make_settings()
    };
    let mut core = TradingCore::build(&settings, None, None, t0()).unwrap();

    // Open on m1 and stop out at a 25% loss.
    let alerts = spike(&mut core, dec!(50000), t0(), &[quote("m1", dec!(0.20))]);
    assert!(matches!(alerts[0], AlertEvent::TradeOpened { .. }));

    let mut prices = HashMap::new();
    prices.insert(PositionKey::new("m1", "Yes"), dec!(0.15));
    let out = core.check_exits(&prices, t0() + Duration::seconds(30));
    assert_eq!(out.fills[0].trade.close_reason, Some(CloseReason::StopLoss));
    assert!(core.gate().risk_status(t0()).daily_loss >= dec!(50));

    // The next admission trips the daily limit.
    let later = t0() + Duration::seconds(120);
    let alerts = spike(&mut core, dec!(55000), later, &[quote("m2", dec!(0.20))]);
    assert!(alerts.iter().any(|a| matches!(a, AlertEvent::RiskHalted { .. })));
    assert_eq!(core.ledger().open_position_count(), 0);
    assert_eq!(core.counters().rejected, 1);
    assert!(core.gate().risk_status(later).trading_halted);

    // Still halted within the halt window.
    let alerts = spike(&mut core, dec!(60000), later + Duration::minutes(10), &[quote("m3", dec!(0.20))]);
    assert!(!alerts.iter().any(|a| matches!(a, AlertEvent::TradeOpened { .. })));
    assert_eq!(core.counters().rejected, 2);

    // A day later the halt has expired and the loss bucket has rolled.
    let next_day = t0() + Duration::hours(25);
    let alerts = spike(&mut core, dec!(50000), next_day, &[quote("m4", dec!(0.20))]);
    assert!(alerts.iter().any(|a| matches!(a, AlertEvent::RiskResumed { .. })));
    assert!(alerts.iter().any(|a| matches!(a, AlertEvent::TradeOpened { .. })));
    assert_eq!(core.gate().risk_status(next_day).daily_loss, Decimal::ZERO);
    assert_eq!(core.ledger().open_position_count(), 1);
}

#[test]
fn test_concurrent_position_cap() {
    let settings = EngineSettings {
        risk: RiskConfig {
            max_concurrent_positions: 2,
            ..Default::default()
        },
        ..make_settings()
    };
    let mut core = TradingCore::build(&settings, None, None, t0()).unwrap();

    let quotes = [quote("m1", dec!(0.20)), quote("m2", dec!(0.20)), quote("m3", dec!(0.20))];
    spike(&mut core, dec!(50000), t0(), &quotes);

    assert_eq!(core.ledger().open_position_count(), 2);
    assert_eq!(core.counters().opportunities, 3);
    assert_eq!(core.counters().rejected, 1);
}

#[test]
fn test_balance_never_negative_under_repeated_losses() {
    let settings = EngineSettings {
        engine: EngineConfig {
            initial_balance: dec!(1000),
            trade_size: dec!(50),
            ..make_settings().engine
        },
        risk: RiskConfig {
            daily_loss_limit_percent: dec!(100),
            emergency_shutdown_loss: dec!(1000000),
            auto_block_poor_sources: false,
            ..Default::default()
        },
        ..make_settings()
    };
    let mut core = TradingCore::build(&settings, None, None, t0()).unwrap();

    for i in 0..20i64 {
        let at = t0() + Duration::minutes(2 * i);
        let id = format!("m{i}");
        spike(&mut core, dec!(50000), at, &[quote(&id, dec!(0.20))]);

        let mut prices = HashMap::new();
        prices.insert(PositionKey::new(id, "Yes"), dec!(0.10));
        core.check_exits(&prices, at + Duration::seconds(30));
        assert!(core.ledger().balance() >= Decimal::ZERO);
    }

    let snap = core.snapshot(t0() + Duration::hours(1));
    assert_eq!(snap.performance.open_positions, 0);
    assert!(snap.performance.total_realized_pnl < Decimal::ZERO);
    assert_eq!(snap.performance.wins, 0);
}

// ---------------------------------------------------------------------------
// Full engine
// ---------------------------------------------------------------------------

struct Harness {
    handle: EngineHandle,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<anyhow::Result<spikegate::engine::runner::EngineReport>>,
}

async fn start_engine(
    settings: EngineSettings,
    odds: Arc<dyn OddsProvider>,
    store: Arc<dyn StateStore>,
    notifier: Arc<RecordingNotifier>,
) -> Harness {
    let notifiers: Vec<Arc<dyn Notifier>> = vec![notifier];
    let (engine, handle) = Engine::start(settings, EngineDeps { odds, store, notifiers })
        .await
        .unwrap();
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(stop_rx));
    Harness { handle, stop, task }
}

async fn send_spike(handle: &EngineHandle) {
    let tx = handle.price_sender();
    let now = Utc::now();
    tx.send(PriceUpdate::new("BTC/USDT", dec!(50000), now)).await.unwrap();
    tx.send(PriceUpdate::new("BTC/USDT", dec!(55000), now + Duration::seconds(5)))
        .await
        .unwrap();
}

async fn wait_until<F: Fn(&spikegate::engine::EngineSnapshot) -> bool>(handle: &EngineHandle, cond: F) {
    for _ in 0..500 {
        if cond(&handle.snapshot().await) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_engine_take_profit_on_exit_tick() {
    let odds = Arc::new(ScriptedOdds::btc(&["btc-a"], dec!(0.20)));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let h = start_engine(make_settings(), odds.clone(), store.clone(), notifier.clone()).await;

    send_spike(&h.handle).await;
    wait_until(&h.handle, |s| s.counters.positions_opened == 1).await;

    odds.set_yes("btc-a", dec!(0.30));
    wait_until(&h.handle, |s| s.counters.positions_closed == 1).await;

    h.stop.send(true).unwrap();
    let report = assert_ok!(h.task.await.unwrap());
    assert_eq!(report.stats.wins, 1);
    assert!(report.stats.total_realized_pnl > Decimal::ZERO);
    assert_eq!(report.stats.open_positions, 0);

    let events = notifier.events();
    assert!(events.iter().any(|e| matches!(e, AlertEvent::TradeOpened { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        AlertEvent::TradeClosed { reason: CloseReason::TakeProfit, .. }
    )));
    assert!(events.iter().any(|e| matches!(e, AlertEvent::DailySummary(_))));
    assert_eq!(store.trade_count().await, 2);
}

#[tokio::test]
async fn test_engine_holds_when_venue_fails() {
    let odds = Arc::new(ScriptedOdds::btc(&["btc-a"], dec!(0.20)));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let h = start_engine(make_settings(), odds.clone(), store.clone(), notifier.clone()).await;

    send_spike(&h.handle).await;
    wait_until(&h.handle, |s| s.counters.positions_opened == 1).await;

    // Lookups fail: the exit tick must not close anything.
    odds.set_error("venue down");
    let before = odds.lookups();
    while odds.lookups() < before + 2 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(h.handle.snapshot().await.counters.positions_closed, 0);

    // Shutdown still closes, falling back to the last mark.
    h.stop.send(true).unwrap();
    let report = h.task.await.unwrap().unwrap();
    assert_eq!(report.stats.open_positions, 0);
    assert_eq!(report.counters.positions_closed, 1);

    let stored = store.load_state(10).await.unwrap().unwrap();
    assert_eq!(stored.closed_positions[0].close_reason, Some(CloseReason::Shutdown));
    assert_eq!(stored.closed_positions[0].current_price, Some(dec!(0.20)));
}

#[tokio::test]
async fn test_engine_restart_from_sqlite() {
    let path = std::env::temp_dir().join(format!("spikegate-it-{}.db", uuid::Uuid::new_v4()));
    let config = StorageConfig {
        backend: "sqlite".to_string(),
        url: format!("sqlite://{}?mode=rwc", path.display()),
        export_path: None,
    };

    let odds = Arc::new(ScriptedOdds::btc(&["btc-a"], dec!(0.20)));
    let store = storage::open_store(&config).await.unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let h = start_engine(make_settings(), odds.clone(), store, notifier).await;

    send_spike(&h.handle).await;
    wait_until(&h.handle, |s| s.counters.positions_opened == 1).await;
    h.stop.send(true).unwrap();
    let report = h.task.await.unwrap().unwrap();
    let final_balance = report.stats.portfolio.balance;

    let store = storage::open_store(&config).await.unwrap();
    assert!(store.get_state(RISK_STATE_KEY).await.unwrap().is_some());
    let notifier = Arc::new(RecordingNotifier::default());
    let h = start_engine(make_settings(), odds, store, notifier).await;

    let snap = h.handle.snapshot().await;
    assert_eq!(snap.ledger.balance, final_balance);
    assert_eq!(snap.ledger.trades.len(), 2);
    assert!(snap.ledger.positions.is_empty());
    assert_eq!(snap.risk.tracked_sources, 1);

    h.stop.send(true).unwrap();
    h.task.await.unwrap().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_engine_exports_report() {
    let path = std::env::temp_dir().join(format!("spikegate-export-{}.json", uuid::Uuid::new_v4()));
    let settings = EngineSettings {
        export_path: Some(path.display().to_string()),
        ..make_settings()
    };
    let odds = Arc::new(ScriptedOdds::btc(&["btc-a"], dec!(0.20)));
    let h = start_engine(settings, odds, Arc::new(MemoryStore::new()), Arc::new(RecordingNotifier::default())).await;

    send_spike(&h.handle).await;
    wait_until(&h.handle, |s| s.counters.price_updates == 2).await;
    h.stop.send(true).unwrap();
    h.task.await.unwrap().unwrap();

    let raw = assert_ok!(std::fs::read_to_string(&path));
    let json: serde_json::Value = assert_ok!(serde_json::from_str(&raw));
    assert!(json.is_object());
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_paper_feed_drives_engine() {
    let paper = PaperConfig {
        tick_min_ms: 5,
        tick_max_ms: 10,
        ..Default::default()
    };
    let odds: Arc<dyn OddsProvider> = Arc::new(PaperMarkets::new(&paper, "15m", Some(3)));
    let notifier = Arc::new(RecordingNotifier::default());
    let h = start_engine(make_settings(), odds, Arc::new(MemoryStore::new()), notifier).await;

    let feed = PaperPriceFeed::new(paper, Some(3));
    let feed_task = tokio::spawn(feed.run(h.handle.price_sender(), h.stop.subscribe()));

    wait_until(&h.handle, |s| s.counters.price_updates >= 10).await;
    h.stop.send(true).unwrap();
    feed_task.await.unwrap();
    let report = h.task.await.unwrap().unwrap();

    assert!(report.counters.price_updates >= 10);
    assert_eq!(report.stats.open_positions, 0);
    assert!(report.stats.portfolio.balance > Decimal::ZERO);
}
