//! CoinGecko REST client.
//!
//! Every call carries its own timeout and is issued exactly once; retries
//! are left to the response cache, whose TTL and single-flight guard keep
//! the request rate bounded.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{downsample_daily, MarketDataProvider, MarketSnapshot};
use crate::config::{is_valid_coin_id, UpstreamConfig};
use crate::utils::types::{round2, MarketRecord, PricePoint, VS_CURRENCY};
use crate::{Error, Result};

/// Client for the CoinGecko v3 API (demo or pro tier).
#[derive(Clone)]
pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
    market_timeout: Duration,
    history_timeout: Duration,
}

#[derive(Deserialize)]
struct CgMarket {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
    current_price: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    total_volume: Option<f64>,
}

#[derive(Deserialize)]
struct CgMarketChart {
    prices: Vec<(f64, f64)>,
}

impl CoinGeckoClient {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("coinrisk/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::ConfigError(format!("build reqwest client: {e}")))?;
        let api_key = Some(cfg.api_key.trim().to_string()).filter(|k| !k.is_empty());
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            api_key_header: cfg.api_key_header.clone(),
            market_timeout: Duration::from_secs(cfg.market_timeout_secs),
            history_timeout: Duration::from_secs(cfg.history_timeout_secs),
        })
    }

    /// Issue one GET and decode the body, classifying every failure.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.get(&url).query(query).timeout(timeout);
        if let Some(key) = &self.api_key {
            req = req.header(self.api_key_header.as_str(), key);
        }

        metrics::counter!("upstream_requests_total", "endpoint" => endpoint).increment(1);
        let start = Instant::now();
        let resp = req.send().await;
        metrics::histogram!("upstream_request_ms", "endpoint" => endpoint)
            .record(start.elapsed().as_millis() as f64);

        let resp = resp?;
        match resp.status() {
            | StatusCode::TOO_MANY_REQUESTS => {
                metrics::counter!("upstream_rate_limited_total", "endpoint" => endpoint)
                    .increment(1);
                warn!(endpoint, "upstream rate limit hit");
                return Err(Error::RateLimited);
            }
            | status if !status.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::Upstream(format!(
                    "{endpoint}: HTTP {status}: {}",
                    body.chars().take(200).collect::<String>()
                )));
            }
            | _ => {}
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::UpstreamMalformedResponse(format!("{endpoint}: {e}")))
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoClient {
    async fn fetch_market_snapshot(&self, coin_ids: &[String]) -> Result<MarketSnapshot> {
        if coin_ids.is_empty() {
            return Ok(MarketSnapshot::default());
        }
        let rows: Vec<CgMarket> = self
            .get_json(
                "markets",
                "/coins/markets",
                &[
                    ("vs_currency", VS_CURRENCY.to_string()),
                    ("ids", coin_ids.join(",")),
                    ("price_change_percentage", "24h".to_string()),
                ],
                self.market_timeout,
            )
            .await?;

        let mut snapshot = MarketSnapshot::default();
        for id in coin_ids {
            let record = rows.iter().find(|r| &r.id == id).and_then(|r| {
                Some(MarketRecord {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    symbol: r.symbol.clone(),
                    current_price: r.current_price?,
                    price_change_percentage_24h: round2(
                        r.price_change_percentage_24h.unwrap_or(0.0),
                    ),
                    total_volume: r.total_volume.unwrap_or(0.0),
                })
            });
            match record {
                | Some(r) => snapshot.records.push(r),
                | None => snapshot.missing.push(id.clone()),
            }
        }
        if snapshot.is_partial() {
            debug!(missing = ?snapshot.missing, "partial market snapshot");
        }
        Ok(snapshot)
    }

    async fn fetch_daily_series(&self, coin_id: &str, days: u32) -> Result<Vec<PricePoint>> {
        if !is_valid_coin_id(coin_id) {
            return Err(Error::InvalidArgument(format!("invalid coin id '{coin_id}'")));
        }
        let chart: CgMarketChart = self
            .get_json(
                "market_chart",
                &format!("/coins/{coin_id}/market_chart"),
                &[("vs_currency", VS_CURRENCY.to_string()), ("days", days.to_string())],
                self.history_timeout,
            )
            .await?;
        Ok(downsample_daily(coin_id, &chart.prices, days))
    }
}
