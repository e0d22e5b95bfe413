//! Daily price backfill from the market-data provider into the store.
//!
//! Backfill is idempotent: it re-fetches the whole window and relies on
//! upsert semantics, except that a coin whose stored window already ends
//! today is skipped without touching the upstream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use super::PriceStore;
use crate::upstream::MarketDataProvider;
use crate::Result;

/// Outcome of backfilling one coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub coin: String,
    /// Daily points returned by the provider
    pub fetched: usize,
    /// Rows inserted or updated
    pub written: usize,
    /// Upstream call skipped because the store was already current
    pub skipped: bool,
}

/// Fetch `days` daily prices for `coin` and upsert them.
pub async fn backfill(
    store: &dyn PriceStore,
    provider: &dyn MarketDataProvider,
    coin: &str,
    days: u32,
) -> Result<BackfillReport> {
    store.ensure_coin(coin).await?;

    if is_current(store, coin, days, Utc::now().date_naive()).await? {
        info!(coin, days, "stored history is current, skipping backfill");
        return Ok(BackfillReport { coin: coin.to_string(), fetched: 0, written: 0, skipped: true });
    }

    let points = provider.fetch_daily_series(coin, days).await?;
    let written = store.upsert_many(&points).await?;
    info!(coin, days, fetched = points.len(), written, "backfill complete");
    Ok(BackfillReport { coin: coin.to_string(), fetched: points.len(), written, skipped: false })
}

/// Whether the store already holds `days` points ending on `today`.
async fn is_current(store: &dyn PriceStore, coin: &str, days: u32, today: NaiveDate) -> Result<bool> {
    let series = store.read_series(coin, days).await?;
    Ok(series.len() >= days as usize && series.points().last().map_or(false, |p| p.date >= today))
}

/// Backfill each coin in turn. One coin failing does not stop the rest.
pub async fn backfill_all(
    store: &dyn PriceStore,
    provider: &dyn MarketDataProvider,
    coins: &[String],
    days: u32,
) -> Vec<(String, Result<BackfillReport>)> {
    let mut outcomes = Vec::with_capacity(coins.len());
    for coin in coins {
        let outcome = backfill(store, provider, coin, days).await;
        if let Err(e) = &outcome {
            warn!(coin = %coin, error = %e, "backfill failed");
        }
        outcomes.push((coin.clone(), outcome));
    }
    outcomes
}

/// Run [`backfill_all`] now and then every `every`, in the background.
/// A zero `every` runs a single round.
pub fn spawn_backfill_loop(
    store: Arc<dyn PriceStore>,
    provider: Arc<dyn MarketDataProvider>,
    coins: Vec<String>,
    days: u32,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            backfill_all(store.as_ref(), provider.as_ref(), &coins, days).await;
            return;
        }
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let outcomes = backfill_all(store.as_ref(), provider.as_ref(), &coins, days).await;
            let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
            info!(coins = outcomes.len(), failed, "backfill round finished");
        }
    })
}
