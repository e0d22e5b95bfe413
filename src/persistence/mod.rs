//! Persistence layer traits and implementations
//!
//! Daily prices are stored once per `(coin, date)` and only ever inserted
//! or updated, never deleted. Request handlers and the backfill talk to
//! [`PriceStore`] so the SQLite backend can be swapped for the in-memory
//! one in tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::utils::types::{CoinSeries, PricePoint};
use crate::Result;

pub mod backfill;
pub mod sqlite;

pub use backfill::{backfill, backfill_all, spawn_backfill_loop, BackfillReport};
pub use sqlite::SqlitePriceStore;

#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Id of the coin master row for `coin`, creating it if absent.
    async fn ensure_coin(&self, coin: &str) -> Result<i64>;

    /// Insert or update one daily price. Repeating a call is a no-op.
    async fn upsert(&self, coin: &str, date: NaiveDate, price: f64) -> Result<()>;

    /// Upsert a batch atomically, returning the number of rows written.
    async fn upsert_many(&self, points: &[PricePoint]) -> Result<usize>;

    /// The most recent `limit_days` prices for `coin`, ascending by date.
    async fn read_series(&self, coin: &str, limit_days: u32) -> Result<CoinSeries>;
}

/// Map-backed store for tests and throw-away runs.
#[derive(Default)]
pub struct MemoryPriceStore {
    coins: Mutex<BTreeMap<String, (i64, BTreeMap<NaiveDate, f64>)>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored prices for `coin`.
    pub fn row_count(&self, coin: &str) -> usize {
        self.lock().get(coin).map_or(0, |(_, rows)| rows.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (i64, BTreeMap<NaiveDate, f64>)>> {
        self.coins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, coin: &str, date: NaiveDate, price: f64) {
        let mut coins = self.lock();
        let next_id = coins.len() as i64 + 1;
        coins
            .entry(coin.to_string())
            .or_insert_with(|| (next_id, BTreeMap::new()))
            .1
            .insert(date, price);
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn ensure_coin(&self, coin: &str) -> Result<i64> {
        let mut coins = self.lock();
        let next_id = coins.len() as i64 + 1;
        Ok(coins.entry(coin.to_string()).or_insert_with(|| (next_id, BTreeMap::new())).0)
    }

    async fn upsert(&self, coin: &str, date: NaiveDate, price: f64) -> Result<()> {
        self.insert(coin, date, price);
        Ok(())
    }

    async fn upsert_many(&self, points: &[PricePoint]) -> Result<usize> {
        for p in points {
            self.insert(&p.coin, p.date, p.price);
        }
        Ok(points.len())
    }

    async fn read_series(&self, coin: &str, limit_days: u32) -> Result<CoinSeries> {
        let coins = self.lock();
        let Some((_, rows)) = coins.get(coin) else {
            return Ok(CoinSeries::empty(coin));
        };
        let skip = rows.len().saturating_sub(limit_days as usize);
        let points = rows
            .iter()
            .skip(skip)
            .map(|(date, price)| PricePoint::new(coin, *date, *price))
            .collect();
        Ok(CoinSeries::new(coin, points))
    }
}
