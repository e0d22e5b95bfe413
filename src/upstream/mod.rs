//! Market-data provider abstraction.
//!
//! The dashboards only need two upstream calls: a batched market snapshot
//! for the configured coins and a daily price series for one coin. Both
//! go through [`MarketDataProvider`] so the cache and the backfill can be
//! exercised against a stub in tests.
//!
//! Outcome classification:
//! * `Ok(snapshot)` with nothing missing: success
//! * `Ok(snapshot)` with `missing` ids: partial failure, callers fill the
//!   gaps from their last good snapshot
//! * `Err(Error::RateLimited)`: HTTP 429, an expected outcome
//! * any other `Err`: timeout, non-2xx, or malformed payload

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use std::collections::BTreeMap;

use crate::utils::types::{MarketRecord, PricePoint};
use crate::Result;

pub mod coingecko;

pub use coingecko::CoinGeckoClient;

/// Result of a batched market snapshot request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    /// Records in the order the coins were requested
    pub records: Vec<MarketRecord>,
    /// Requested ids the provider returned nothing usable for
    pub missing: Vec<String>,
}

impl MarketSnapshot {
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Trait for providers that fetch market data over the network.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current price, 24h change and volume for each requested coin.
    async fn fetch_market_snapshot(&self, coin_ids: &[String]) -> Result<MarketSnapshot>;

    /// At most `days` daily USD prices for `coin_id`, ascending by date.
    async fn fetch_daily_series(&self, coin_id: &str, days: u32) -> Result<Vec<PricePoint>>;
}

/// Reduce raw `(unix_ms, price)` samples to one price per UTC calendar day.
///
/// The first sample of each day wins and only the most recent `days` days
/// are kept, so hourly and daily inputs both yield at most `days` points.
/// Samples are ordered by timestamp first, making the result independent
/// of input order.
pub fn downsample_daily(coin: &str, raw: &[(f64, f64)], days: u32) -> Vec<PricePoint> {
    let mut samples: Vec<(i64, f64)> = raw
        .iter()
        .filter(|(ts, price)| ts.is_finite() && price.is_finite() && *price > 0.0)
        .map(|(ts, price)| (*ts as i64, *price))
        .collect();
    samples.sort_by_key(|(ts, _)| *ts);

    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for (ts, price) in samples {
        if let Some(dt) = DateTime::from_timestamp_millis(ts) {
            by_day.entry(dt.date_naive()).or_insert(price);
        }
    }

    let skip = by_day.len().saturating_sub(days as usize);
    by_day
        .into_iter()
        .skip(skip)
        .map(|(date, price)| PricePoint::new(coin, date, price))
        .collect()
}
