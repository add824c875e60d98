//! Operator alerts.
//!
//! The engine turns fills and risk events into [`AlertEvent`]s and hands them
//! to every configured [`Notifier`] via [`dispatch`], which spawns the send
//! so the trading loop never waits on a webhook.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::accountant::DailySummary;
use crate::strategy::risk::{RiskEvent, RiskEventKind};
use crate::types::{CloseReason, Direction, PositionKey};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Mirror alerts into the log.
    pub log: bool,
    /// Name of the env var holding the webhook URL.
    pub webhook_url_env: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url_env: Some("SPIKEGATE_WEBHOOK_URL".to_string()),
        }
    }
}

/// Build the configured notifiers. A missing webhook variable disables the
/// webhook rather than failing startup.
pub fn build_notifiers(config: &AlertsConfig) -> Result<Vec<Arc<dyn Notifier>>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if config.log {
        notifiers.push(Arc::new(LogNotifier));
    }

    if let Some(env_name) = &config.webhook_url_env {
        match std::env::var(env_name) {
            Ok(url) if !url.trim().is_empty() => {
                notifiers.push(Arc::new(WebhookNotifier::new(SecretString::new(url))?));
                info!(env = %env_name, "Webhook notifications enabled");
            }
            _ => info!(env = %env_name, "Webhook URL not set, webhook notifications disabled"),
        }
    }
    Ok(notifiers)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Trade,
}

impl AlertLevel {
    /// Embed colour for webhook payloads.
    pub fn color(&self) -> u32 {
        match self {
            AlertLevel::Info => 0x3498db,
            AlertLevel::Warning => 0xf39c12,
            AlertLevel::Critical => 0xe74c3c,
            AlertLevel::Trade => 0x2ecc71,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    TradeOpened {
        symbol: String,
        key: PositionKey,
        direction: Direction,
        amount: Decimal,
        price: Decimal,
        divergence: Decimal,
    },
    TradeClosed {
        symbol: String,
        key: PositionKey,
        pnl: Decimal,
        held_secs: i64,
        reason: CloseReason,
    },
    RiskHalted {
        reason: String,
    },
    RiskResumed {
        message: String,
    },
    SourceBlocked {
        source_id: String,
        reason: String,
    },
    EmergencyShutdown {
        reason: String,
    },
    DailySummary(DailySummary),
}

impl AlertEvent {
    /// Map a risk-gate event to an alert. Unblocks have no alert.
    pub fn from_risk_event(event: &RiskEvent) -> Option<Self> {
        match event.kind {
            RiskEventKind::TradingHalted => Some(AlertEvent::RiskHalted {
                reason: event.message.clone(),
            }),
            RiskEventKind::TradingResumed | RiskEventKind::EmergencyReset => Some(AlertEvent::RiskResumed {
                message: event.message.clone(),
            }),
            RiskEventKind::SourceAutoBlocked | RiskEventKind::SourceManualBlock => Some(AlertEvent::SourceBlocked {
                source_id: event.source_id.clone().unwrap_or_default(),
                reason: event.message.clone(),
            }),
            RiskEventKind::EmergencyShutdown => Some(AlertEvent::EmergencyShutdown {
                reason: event.message.clone(),
            }),
            RiskEventKind::SourceUnblocked => None,
        }
    }

    pub fn level(&self) -> AlertLevel {
        match self {
            AlertEvent::TradeOpened { .. } => AlertLevel::Trade,
            AlertEvent::TradeClosed { pnl, .. } if *pnl > Decimal::ZERO => AlertLevel::Trade,
            AlertEvent::TradeClosed { .. } => AlertLevel::Warning,
            AlertEvent::RiskHalted { .. } | AlertEvent::SourceBlocked { .. } => AlertLevel::Warning,
            AlertEvent::EmergencyShutdown { .. } => AlertLevel::Critical,
            AlertEvent::RiskResumed { .. } | AlertEvent::DailySummary(_) => AlertLevel::Info,
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertEvent::TradeOpened { symbol, direction, .. } => {
                format!("Trade Opened: {symbol} {}", direction.to_string().to_uppercase())
            }
            AlertEvent::TradeClosed { symbol, .. } => format!("Trade Closed: {symbol}"),
            AlertEvent::RiskHalted { .. } => "Trading Halted".to_string(),
            AlertEvent::RiskResumed { .. } => "Trading Resumed".to_string(),
            AlertEvent::SourceBlocked { source_id, .. } => format!("Source Blocked: {source_id}"),
            AlertEvent::EmergencyShutdown { .. } => "EMERGENCY SHUTDOWN".to_string(),
            AlertEvent::DailySummary(s) => format!("Daily Summary {}", s.date),
        }
    }

    pub fn message(&self) -> String {
        match self {
            AlertEvent::TradeOpened { divergence, .. } => {
                format!("New position opened on {:.1}% divergence", divergence * Decimal::ONE_HUNDRED)
            }
            AlertEvent::TradeClosed { pnl, .. } => {
                let outcome = if *pnl > Decimal::ZERO { "profit" } else { "loss" };
                format!("Position closed with {outcome}")
            }
            AlertEvent::RiskHalted { reason } => reason.clone(),
            AlertEvent::RiskResumed { message } => message.clone(),
            AlertEvent::SourceBlocked { reason, .. } => reason.clone(),
            AlertEvent::EmergencyShutdown { reason } => reason.clone(),
            AlertEvent::DailySummary(s) => s.to_string(),
        }
    }

    /// Name/value pairs rendered as embed fields.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            AlertEvent::TradeOpened {
                symbol,
                key,
                direction,
                amount,
                price,
                divergence,
            } => vec![
                ("Symbol", symbol.clone()),
                ("Market", key.to_string()),
                ("Direction", direction.to_string()),
                ("Size", format!("${:.2}", amount)),
                ("Entry Price", format!("{:.3}", price)),
                ("Divergence", format!("{:.1}%", divergence * Decimal::ONE_HUNDRED)),
            ],
            AlertEvent::TradeClosed {
                symbol,
                key,
                pnl,
                held_secs,
                reason,
            } => vec![
                ("Symbol", symbol.clone()),
                ("Market", key.to_string()),
                ("P&L", format!("${:.2}", pnl)),
                ("Hold Time", format!("{held_secs}s")),
                ("Exit Reason", reason.to_string()),
            ],
            AlertEvent::DailySummary(s) => vec![
                ("Buys", s.buys.to_string()),
                ("Closes", s.closes.to_string()),
                ("Wins", s.wins.to_string()),
                ("P&L", format!("${:.2}", s.realized_pnl)),
                ("Equity", format!("${:.2}", s.total_equity)),
            ],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;

    fn name(&self) -> &str;
}

/// Fire-and-forget: send `event` on a spawned task and log any failure.
pub fn dispatch(notifier: Arc<dyn Notifier>, event: AlertEvent) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&event).await {
            error!(notifier = notifier.name(), title = %event.title(), error = %e, "Notification failed");
        }
    })
}

/// [`dispatch`] to every notifier.
pub fn dispatch_all(notifiers: &[Arc<dyn Notifier>], event: &AlertEvent) -> Vec<JoinHandle<()>> {
    notifiers
        .iter()
        .map(|n| dispatch(Arc::clone(n), event.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Writes alerts to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let title = event.title();
        let message = event.message();
        match event.level() {
            AlertLevel::Critical | AlertLevel::Warning => warn!(title = %title, "{message}"),
            AlertLevel::Info | AlertLevel::Trade => info!(title = %title, "{message}"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Posts Discord-style embeds to a webhook URL.
pub struct WebhookNotifier {
    http: Client,
    url: SecretString,
}

impl WebhookNotifier {
    pub fn new(url: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { http, url })
    }

    pub fn payload(event: &AlertEvent, now: DateTime<Utc>) -> serde_json::Value {
        let mut embed = json!({
            "title": event.title(),
            "description": event.message(),
            "timestamp": now.to_rfc3339(),
            "color": event.level().color(),
        });
        let fields = event.fields();
        if !fields.is_empty() {
            embed["fields"] = fields
                .into_iter()
                .map(|(name, value)| json!({ "name": name, "value": value, "inline": true }))
                .collect();
        }
        json!({ "embeds": [embed] })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let resp = self
            .http
            .post(self.url.expose_secret().as_str())
            .json(&Self::payload(event, Utc::now()))
            .send()
            .await
            .context("Webhook request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Webhook returned {status}: {body}");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
