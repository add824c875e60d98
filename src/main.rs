//! SPIKEGATE: signal-gated paper trader for crypto up/down prediction markets.
//!
//! Entry point. Loads configuration, initialises structured logging, wires
//! the odds adapter, state store and notifiers into the engine, starts the
//! paper price feed, and runs until Ctrl+C with a graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use spikegate::alerts;
use spikegate::config;
use spikegate::engine::runner::{Engine, EngineDeps};
use spikegate::platforms::paper::{PaperMarkets, PaperPriceFeed};
use spikegate::platforms::polymarket::GammaOddsClient;
use spikegate::platforms::OddsProvider;
use spikegate::storage;

const BANNER: &str = r#"
 ____  ____ ___ _  _______ ____    _  _____ _____
/ ___||  _ \_ _| |/ / ____/ ___|  / \|_   _| ____|
\___ \| |_) | || ' /|  _|| |  _  / _ \ | | |  _|
 ___) |  __/| || . \| |__| |_| |/ ___ \| | | |___
|____/|_|  |___|_|\_\_____\____/_/   \_\_| |_____|

  Spike-gated paper trading for crypto up/down markets
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let path = std::env::var("SPIKEGATE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.engine.name,
        initial_balance = format!("${:.2}", cfg.engine.initial_balance),
        odds_source = %cfg.engine.odds_source,
        timeframe = %cfg.engine.timeframe,
        store = %cfg.storage.backend,
        "SPIKEGATE starting up"
    );

    // -- Adapters ----------------------------------------------------------

    let odds: Arc<dyn OddsProvider> = match cfg.engine.odds_source.as_str() {
        "polymarket" => {
            info!(base_url = %cfg.polymarket.base_url, "Using Polymarket Gamma odds");
            Arc::new(GammaOddsClient::new(cfg.polymarket.clone())?)
        }
        _ => {
            let markets = PaperMarkets::new(&cfg.paper, &cfg.engine.timeframe, cfg.engine.seed);
            info!(markets = markets.markets().len(), "Using simulated paper markets");
            Arc::new(markets)
        }
    };

    let store = storage::open_store(&cfg.storage).await?;
    let notifiers = alerts::build_notifiers(&cfg.alerts)?;
    if notifiers.is_empty() {
        warn!("No notifiers configured; alerts will be dropped");
    }

    let (engine, handle) = Engine::start(
        cfg.engine_settings(),
        EngineDeps {
            odds,
            store,
            notifiers,
        },
    )
    .await?;

    // -- Price feed and shutdown signal ------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed = PaperPriceFeed::new(cfg.paper.clone(), cfg.engine.seed);
    let feed_task = tokio::spawn(feed.run(handle.price_sender(), shutdown_rx.clone()));
    drop(handle);

    let signal_task = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C; shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Engine running. Press Ctrl+C to stop.");
    let result = engine.run(shutdown_rx).await;

    signal_task.abort();
    if let Err(e) = feed_task.await {
        warn!(error = %e, "Price feed task ended abnormally");
    }

    let report = result?;
    info!(
        balance = format!("${:.2}", report.stats.portfolio.balance),
        realized_pnl = format!("${:.2}", report.stats.total_realized_pnl),
        trades = report.stats.closed_trades,
        price_updates = report.counters.price_updates,
        opportunities = report.counters.opportunities,
        rejected = report.counters.rejected,
        discarded = report.discarded_events,
        "SPIKEGATE shut down cleanly."
    );

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spikegate=info"));

    let json_logging = std::env::var("SPIKEGATE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
