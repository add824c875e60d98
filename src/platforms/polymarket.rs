//! Polymarket integration (read-only).
//!
//! Uses the Gamma API for market discovery and current outcome prices.
//! No auth is required and nothing here places orders.
//!
//! Gamma API: https://gamma-api.polymarket.com

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::platforms::OddsProvider;
use crate::types::{CryptoMarket, MarketOdds};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GammaConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// First backoff delay; doubles per retry up to 5s.
    pub retry_base_ms: u64,
    /// Page size for market discovery.
    pub market_limit: u32,
}

impl Default for GammaConfig {
    fn default() -> Self {
        Self {
            base_url: GAMMA_API_URL.to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_base_ms: 250,
            market_limit: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Gamma API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct GammaMarket {
    #[serde(default, deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed: bool,
    /// Outcome prices as JSON string: "[\"0.65\",\"0.35\"]"
    #[serde(default, rename = "outcomePrices")]
    pub outcome_prices: Option<String>,
}

/// Gamma has served ids both as numbers and as strings.
fn id_as_string<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GammaOddsClient {
    http: Client,
    config: GammaConfig,
}

impl GammaOddsClient {
    pub fn new(config: GammaConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build Gamma HTTP client")?;

        Ok(Self { http, config })
    }

    /// GET with exponential backoff on transport errors, 429 and 5xx.
    /// A 404 comes back as None.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut delay = Duration::from_millis(self.config.retry_base_ms);

        for attempt in 0..=self.config.max_retries {
            let retry_reason = match self.http.get(&url).query(query).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) if resp.status().is_success() => {
                    let body = resp
                        .json::<T>()
                        .await
                        .with_context(|| format!("Failed to parse Gamma response from {path}"))?;
                    return Ok(Some(body));
                }
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error() => {
                    format!("status {}", resp.status())
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("Gamma API error {status}: {body}");
                }
                Err(e) => e.to_string(),
            };

            if attempt < self.config.max_retries {
                warn!(
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    error = %retry_reason,
                    delay_ms = delay.as_millis() as u64,
                    "Gamma request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            } else {
                anyhow::bail!(
                    "Gamma request to {path} failed after {} attempts: {retry_reason}",
                    attempt + 1
                );
            }
        }

        anyhow::bail!("Gamma request to {path} exhausted retries")
    }

    /// Fetch active markets (no auth required).
    pub async fn fetch_gamma_markets(&self) -> Result<Vec<GammaMarket>> {
        debug!("Fetching Polymarket markets from Gamma API");
        let query = [
            ("active", "true".to_string()),
            ("closed", "false".to_string()),
            ("limit", self.config.market_limit.to_string()),
        ];
        let markets: Vec<GammaMarket> = self.get_json("/markets", &query).await?.unwrap_or_default();
        info!(count = markets.len(), "Fetched raw Gamma markets");
        Ok(markets)
    }

    /// Parse outcome prices from Gamma's string format.
    /// Handles: "[\"0.65\",\"0.35\"]", "0.65, 0.35", etc.
    pub fn parse_outcome_prices(s: &str) -> Option<MarketOdds> {
        let cleaned = s.replace(['[', ']', '"', '\\'], "");
        let parts: Vec<&str> = cleaned.split(',').map(|p| p.trim()).collect();
        if parts.len() < 2 {
            return None;
        }
        let yes: Decimal = parts[0].parse().ok()?;
        let no: Decimal = parts[1].parse().ok()?;
        let in_range = |p: Decimal| p >= Decimal::ZERO && p <= Decimal::ONE;
        if !in_range(yes) || !in_range(no) {
            return None;
        }
        Some(MarketOdds { yes, no })
    }

    /// Whether a Gamma market is the up/down market for `asset` over `timeframe`.
    pub fn is_crypto_updown(gm: &GammaMarket, asset: &str, timeframe: &str) -> bool {
        if gm.closed {
            return false;
        }
        let asset = asset.to_lowercase();
        let slug = gm.slug.to_lowercase();
        if slug.starts_with(&format!("{asset}-updown-{}", timeframe.to_lowercase())) {
            return true;
        }

        let question = gm.question.to_lowercase();
        let names: &[&str] = match asset.as_str() {
            "btc" => &["btc", "bitcoin"],
            "eth" => &["eth", "ethereum"],
            "sol" => &["sol", "solana"],
            "xrp" => &["xrp"],
            other => return question.contains(other) && question.contains("up or down"),
        };
        names.iter().any(|n| question.contains(n)) && question.contains("up or down")
    }

    pub fn convert_market(gm: &GammaMarket, asset: &str, timeframe: &str) -> Option<CryptoMarket> {
        if gm.id.is_empty() || gm.question.is_empty() {
            return None;
        }
        let end_date = gm
            .end_date
            .as_deref()
            .and_then(|d| chrono::DateTime::parse_from_rfc3339(d).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Some(CryptoMarket {
            id: gm.id.clone(),
            question: gm.question.clone(),
            asset: asset.to_uppercase(),
            timeframe: timeframe.to_string(),
            end_date,
        })
    }
}

#[async_trait]
impl OddsProvider for GammaOddsClient {
    async fn market_odds(&self, market_id: &str) -> Result<Option<MarketOdds>> {
        let path = format!("/markets/{market_id}");
        let Some(gm) = self.get_json::<GammaMarket>(&path, &[]).await? else {
            debug!(market_id, "Gamma market not found");
            return Ok(None);
        };

        let odds = gm.outcome_prices.as_deref().and_then(Self::parse_outcome_prices);
        if odds.is_none() {
            warn!(market_id, raw = ?gm.outcome_prices, "Unparseable Gamma outcome prices");
        }
        Ok(odds)
    }

    async fn crypto_markets(&self, asset: &str, timeframe: &str) -> Result<Vec<CryptoMarket>> {
        let markets: Vec<CryptoMarket> = self
            .fetch_gamma_markets()
            .await?
            .iter()
            .filter(|gm| Self::is_crypto_updown(gm, asset, timeframe))
            .filter_map(|gm| Self::convert_market(gm, asset, timeframe))
            .collect();

        info!(asset, timeframe, count = markets.len(), "Crypto up/down markets found");
        Ok(markets)
    }

    fn name(&self) -> &str {
        "polymarket"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
