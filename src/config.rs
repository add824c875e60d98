//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to its component defaults, so a partial file is valid.
//! Secrets (the webhook URL) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

use crate::alerts::AlertsConfig;
use crate::engine::{EngineConfig, EngineSettings};
use crate::platforms::paper::PaperConfig;
use crate::platforms::polymarket::GammaConfig;
use crate::storage::StorageConfig;
use crate::strategy::detector::DetectorConfig;
use crate::strategy::exit::ExitConfig;
use crate::strategy::risk::RiskConfig;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub detector: DetectorConfig,
    pub risk: RiskConfig,
    pub paper: PaperConfig,
    pub exit: ExitConfig,
    pub polymarket: GammaConfig,
    pub storage: StorageConfig,
    pub alerts: AlertsConfig,
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a sane run.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.initial_balance <= Decimal::ZERO {
            anyhow::bail!("engine.initial_balance must be positive");
        }
        if e.trade_size <= Decimal::ZERO {
            anyhow::bail!("engine.trade_size must be positive");
        }
        if e.copy_percent <= Decimal::ZERO || e.copy_percent > Decimal::ONE_HUNDRED {
            anyhow::bail!("engine.copy_percent must be in (0, 100]");
        }
        if e.channel_capacity == 0 {
            anyhow::bail!("engine.channel_capacity must be at least 1");
        }
        if !matches!(e.odds_source.as_str(), "paper" | "polymarket") {
            anyhow::bail!("engine.odds_source must be \"paper\" or \"polymarket\", got {:?}", e.odds_source);
        }

        let d = &self.detector;
        if d.spike_threshold <= Decimal::ZERO {
            anyhow::bail!("detector.spike_threshold must be positive");
        }
        if d.spike_window_secs <= 0 || d.spike_window_secs > d.history_window_secs {
            anyhow::bail!("detector.spike_window_secs must be in (0, history_window_secs]");
        }

        let r = &self.risk;
        for (name, pct) in [
            ("daily_loss_limit_percent", r.daily_loss_limit_percent),
            ("max_position_size_percent", r.max_position_size_percent),
            ("stop_loss_percent", r.stop_loss_percent),
            ("take_profit_percent", r.take_profit_percent),
        ] {
            if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                anyhow::bail!("risk.{name} must be in (0, 100]");
            }
        }
        if r.halt_hours <= 0 {
            anyhow::bail!("risk.halt_hours must be positive");
        }

        let c = &self.paper.costs;
        if c.slippage_min < Decimal::ZERO || c.slippage_min > c.slippage_max {
            anyhow::bail!("paper.costs: need 0 <= slippage_min <= slippage_max");
        }
        if c.taker_fee_rate < Decimal::ZERO {
            anyhow::bail!("paper.costs.taker_fee_rate must not be negative");
        }
        if self.paper.symbols.is_empty() {
            anyhow::bail!("paper.symbols must list at least one symbol");
        }
        if self.paper.tick_min_ms > self.paper.tick_max_ms {
            anyhow::bail!("paper.tick_min_ms must not exceed tick_max_ms");
        }

        if self.exit.soft_expiry_secs > self.exit.hard_expiry_secs {
            anyhow::bail!("exit.soft_expiry_secs must not exceed hard_expiry_secs");
        }

        if !matches!(self.storage.backend.as_str(), "memory" | "sqlite") {
            anyhow::bail!("storage.backend must be \"memory\" or \"sqlite\"");
        }
        Ok(())
    }

    /// Component settings for the trading core.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            engine: self.engine.clone(),
            detector: self.detector.clone(),
            risk: self.risk.clone(),
            exit: self.exit.clone(),
            costs: self.paper.costs.clone(),
            export_path: self.storage.export_path.clone(),
        }
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
