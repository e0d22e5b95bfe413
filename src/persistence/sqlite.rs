//! SQLite price store using `rusqlite`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::PriceStore;
use crate::config::{StoreConfig, MAX_BUSY_RETRIES};
use crate::utils::types::{symbol_for, CoinSeries, PricePoint};
use crate::{Error, Result};

const UPSERT_PRICE: &str = "INSERT INTO price_history (coin_id, date, price) VALUES (?1, ?2, ?3)
     ON CONFLICT(coin_id, date) DO UPDATE SET price = excluded.price";

/// Thread-safe SQLite wrapper shared across async tasks.
#[derive(Clone)]
pub struct SqlitePriceStore {
    conn: Arc<Mutex<Connection>>, // wrapped for async use via spawn_blocking
    max_busy_retries: u32,
}

impl SqlitePriceStore {
    /// Open (or create) the database at `path`, creating parent dirs.
    pub async fn open(path: impl Into<PathBuf>, cfg: &StoreConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let busy_timeout = Duration::from_millis(cfg.busy_timeout_ms);
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            debug!(path = %path.display(), journal_mode = %mode, "opened price store");
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), max_busy_retries: cfg.max_busy_retries })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), max_busy_retries: 0 })
    }

    /// Run `op` on the blocking pool, retrying with exponential backoff
    /// while SQLite reports the database as busy or locked.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 0u32;
        loop {
            let conn = self.conn.clone();
            let op = op.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                op(&mut *conn).map_err(Error::from)
            })
            .await?;
            match outcome {
                | Err(Error::StorageContention(msg)) if attempt < self.max_busy_retries => {
                    attempt += 1;
                    let backoff = busy_backoff(attempt);
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy: {msg}");
                    tokio::time::sleep(backoff).await;
                }
                | other => return other,
            }
        }
    }
}

/// Delay before retry `attempt` (1-based): 100ms doubling, capped at ~51s.
fn busy_backoff(attempt: u32) -> Duration {
    Duration::from_millis(50u64.saturating_mul(1 << attempt.min(MAX_BUSY_RETRIES)))
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS coins (
             id           INTEGER PRIMARY KEY AUTOINCREMENT,
             name         TEXT NOT NULL UNIQUE,
             symbol       TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS price_history (
             id           INTEGER PRIMARY KEY AUTOINCREMENT,
             coin_id      INTEGER NOT NULL REFERENCES coins(id),
             date         TEXT NOT NULL,
             price        REAL NOT NULL,
             UNIQUE (coin_id, date)
         );",
    )
}

fn coin_row(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO coins (name, symbol) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![name, symbol_for(name)],
    )?;
    conn.query_row("SELECT id FROM coins WHERE name = ?1", [name], |row| row.get(0))
}

#[async_trait]
impl PriceStore for SqlitePriceStore {
    async fn ensure_coin(&self, coin: &str) -> Result<i64> {
        let coin = coin.to_string();
        self.with_conn(move |conn| coin_row(conn, &coin)).await
    }

    async fn upsert(&self, coin: &str, date: NaiveDate, price: f64) -> Result<()> {
        let coin = coin.to_string();
        self.with_conn(move |conn| {
            let id = coin_row(conn, &coin)?;
            conn.execute(UPSERT_PRICE, params![id, date, price])?;
            Ok(())
        })
        .await
    }

    async fn upsert_many(&self, points: &[PricePoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let points = points.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut ids: HashMap<&str, i64> = HashMap::new();
                let mut stmt = tx.prepare_cached(UPSERT_PRICE)?;
                for p in &points {
                    let id = match ids.get(p.coin.as_str()) {
                        | Some(id) => *id,
                        | None => {
                            let id = coin_row(&tx, &p.coin)?;
                            ids.insert(&p.coin, id);
                            id
                        }
                    };
                    written += stmt.execute(params![id, p.date, p.price])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn read_series(&self, coin: &str, limit_days: u32) -> Result<CoinSeries> {
        let coin = coin.to_string();
        self.with_conn(move |conn| {
            let Some(id) = conn
                .query_row("SELECT id FROM coins WHERE name = ?1", [&coin], |row| row.get::<_, i64>(0))
                .optional()?
            else {
                return Ok(CoinSeries::empty(&coin));
            };
            let mut stmt = conn.prepare_cached(
                "SELECT date, price FROM price_history WHERE coin_id = ?1
                 ORDER BY date DESC LIMIT ?2",
            )?;
            let points = stmt
                .query_map(params![id, limit_days], |row| {
                    Ok(PricePoint::new(&coin, row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(CoinSeries::new(&coin, points))
        })
        .await
    }
}
