//! Query layer behind the dashboard endpoints.
//!
//! Every payload goes through a [`CoalescingCache`], so upstream failures
//! surface as stale or empty payloads and never as errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::risk::{MetricsEngine, RiskSnapshot};
use crate::cache::{CoalescingCache, ResourceKey};
use crate::config::Config;
use crate::persistence::PriceStore;
use crate::upstream::MarketDataProvider;
use crate::utils::types::{round2, CoinSeries, MarketRecord};
use crate::{Error, Result};

/// Days of history shown on the price chart.
pub const HISTORY_DAYS: u32 = 7;

/// `/api/history` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryChart {
    pub dates: Vec<String>,
    pub prices: BTreeMap<String, Vec<f64>>,
}

/// Column-oriented risk figures for the charts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSeries {
    pub labels: Vec<String>,
    pub volatility: Vec<f64>,
    pub sharpe: Vec<f64>,
    pub beta: Vec<f64>,
    pub var: Vec<f64>,
}

/// One row of the risk table; `coin` holds the ticker symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRow {
    pub coin: String,
    pub volatility: f64,
    pub sharpe: f64,
    pub beta: f64,
    pub var: f64,
}

/// `/api/risk-metrics` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub metrics: RiskSeries,
    pub table: Vec<RiskRow>,
}

impl RiskReport {
    pub fn from_snapshots(snapshots: &[RiskSnapshot]) -> Self {
        let mut report = RiskReport::default();
        for snap in snapshots.iter().map(RiskSnapshot::rounded) {
            report.metrics.labels.push(snap.symbol.clone());
            report.metrics.volatility.push(snap.volatility);
            report.metrics.sharpe.push(snap.sharpe);
            report.metrics.beta.push(snap.beta);
            report.metrics.var.push(snap.var);
            report.table.push(RiskRow {
                coin: snap.symbol,
                volatility: snap.volatility,
                sharpe: snap.sharpe,
                beta: snap.beta,
                var: snap.var,
            });
        }
        report
    }
}

/// Shared state of the dashboard handlers.
pub struct DashboardService {
    config: Config,
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn PriceStore>,
    engine: MetricsEngine,
    market: CoalescingCache<ResourceKey, Arc<Vec<MarketRecord>>>,
    history: CoalescingCache<ResourceKey, Arc<CoinSeries>>,
    risk: CoalescingCache<ResourceKey, Arc<RiskReport>>,
}

impl DashboardService {
    pub fn new(config: Config, provider: Arc<dyn MarketDataProvider>, store: Arc<dyn PriceStore>) -> Self {
        let wait = config.cache.wait_timeout();
        Self {
            engine: MetricsEngine::from_config(&config.risk),
            market: CoalescingCache::new("market", wait),
            history: CoalescingCache::new("history", wait),
            risk: CoalescingCache::new("risk", wait),
            config,
            provider,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Market rows for the configured coins, in configured order.
    pub async fn market_snapshot(&self) -> Arc<Vec<MarketRecord>> {
        let key = ResourceKey::MarketSnapshot;
        let ttl = key.ttl(&self.config.cache);
        self.market
            .get_or_refresh(key, ttl, |previous| self.refresh_market(previous))
            .await
            .into_value()
    }

    async fn refresh_market(&self, previous: Option<Arc<Vec<MarketRecord>>>) -> Result<Arc<Vec<MarketRecord>>> {
        let snapshot = self.provider.fetch_market_snapshot(&self.config.coins).await?;
        let previous = previous.as_deref().map(Vec::as_slice).unwrap_or_default();
        let records: Vec<MarketRecord> = self
            .config
            .coins
            .iter()
            .filter_map(|id| {
                snapshot
                    .records
                    .iter()
                    .chain(previous.iter())
                    .find(|r| &r.id == id)
                    .cloned()
            })
            .collect();
        if records.is_empty() {
            return Err(Error::NoDataAvailable("market snapshot".into()));
        }
        Ok(Arc::new(records))
    }

    /// Seven daily prices per requested coin. Ids outside the configured
    /// list are ignored.
    pub async fn history(&self, requested: &[String]) -> HistoryChart {
        let mut coins: Vec<&String> = Vec::new();
        for coin in requested {
            if self.config.coins.contains(coin) && !coins.contains(&coin) {
                coins.push(coin);
            }
        }
        if coins.is_empty() {
            return HistoryChart::default();
        }

        let series = join_all(coins.iter().map(|coin| self.coin_history(coin))).await;

        let mut chart = HistoryChart::default();
        let mut longest = 0;
        for (coin, series) in coins.into_iter().zip(series) {
            let prices: Vec<f64> = series.prices().into_iter().map(round2).collect();
            longest = longest.max(prices.len());
            chart.prices.insert(coin.clone(), prices);
        }
        chart.dates = (1..=longest).map(|i| format!("Day{i}")).collect();
        chart
    }

    async fn coin_history(&self, coin: &str) -> Arc<CoinSeries> {
        let key = ResourceKey::History { coin: coin.to_string() };
        let ttl = key.ttl(&self.config.cache);
        let provider = &self.provider;
        self.history
            .get_or_refresh(key, ttl, |_| async move {
                let points = provider.fetch_daily_series(coin, HISTORY_DAYS).await?;
                if points.is_empty() {
                    return Err(Error::NoDataAvailable(format!("history for {coin}")));
                }
                Ok(Arc::new(CoinSeries::new(coin, points)))
            })
            .await
            .into_option()
            .unwrap_or_else(|| Arc::new(CoinSeries::empty(coin)))
    }

    /// Risk report over `days`. Unsupported windows fall back to the
    /// default window.
    pub async fn risk_metrics(&self, days: u32) -> Arc<RiskReport> {
        let days = if self.config.risk.windows.contains(&days) { days } else { self.config.risk.default_window };
        let key = ResourceKey::RiskMetrics { days };
        let ttl = key.ttl(&self.config.cache);
        self.risk
            .get_or_refresh(key, ttl, |_| self.compute_risk(days))
            .await
            .into_value()
    }

    async fn compute_risk(&self, days: u32) -> Result<Arc<RiskReport>> {
        let benchmark = self.store.read_series(&self.config.risk.benchmark, days).await?;
        let mut snapshots = Vec::with_capacity(self.config.coins.len());
        for coin in &self.config.coins {
            let series = match self.store.read_series(coin, days).await {
                | Ok(series) => series,
                | Err(e) => {
                    warn!(coin = %coin, days, error = %e, "reading history for risk failed");
                    continue;
                }
            };
            match self.engine.compute(&series, &benchmark) {
                | Some(snap) => snapshots.push(snap),
                | None => debug!(coin = %coin, days, points = series.len(), "not enough history for risk"),
            }
        }
        if snapshots.is_empty() {
            return Err(Error::NoDataAvailable(format!("risk metrics for {days} days")));
        }
        Ok(Arc::new(RiskReport::from_snapshots(&snapshots)))
    }
}
