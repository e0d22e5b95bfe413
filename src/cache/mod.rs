//! In-process response cache with TTL staleness and per-key single-flight.
//!
//! A lookup is a hit while `now - fetched_at < ttl`. Otherwise exactly one
//! caller (the leader) runs the refresh while every other caller for the
//! same key waits on it, bounded by `wait_timeout`. A failed refresh never
//! replaces the last good value: the caller gets that value back marked
//! stale, or [`Served::Empty`] when nothing was ever fetched.
//!
//! The slot map sits behind a `std::sync::Mutex` that is only held to read
//! or update slots, never while a refresh is running, so a slow upstream
//! call for one key does not hold up the others.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::Result;

/// Cache keys: a resource kind plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Snapshot of every configured coin (one global key)
    MarketSnapshot,
    /// Seven-day daily history for one coin
    History { coin: String },
    /// Risk table for one lookback window
    RiskMetrics { days: u32 },
}

impl ResourceKey {
    /// TTL for this key's resource kind.
    pub fn ttl(&self, cfg: &CacheConfig) -> Duration {
        match self {
            | ResourceKey::MarketSnapshot => cfg.market_ttl(),
            | ResourceKey::History { .. } => cfg.history_ttl(),
            | ResourceKey::RiskMetrics { .. } => cfg.risk_ttl(),
        }
    }
}

/// What a lookup handed back and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Served<V> {
    /// Fresh value, no upstream call made by this caller
    Hit(V),
    /// Fresh value produced by this caller's refresh
    Refreshed(V),
    /// Expired value returned because the refresh failed or took too long
    Stale(V),
    /// Nothing cached and nothing could be fetched
    Empty,
}

impl<V> Served<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            | Served::Hit(v) | Served::Refreshed(v) | Served::Stale(v) => Some(v),
            | Served::Empty => None,
        }
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            | Served::Hit(v) | Served::Refreshed(v) | Served::Stale(v) => Some(v),
            | Served::Empty => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Served::Stale(_))
    }
}

impl<V: Default> Served<V> {
    /// The served value, or the empty default.
    pub fn into_value(self) -> V {
        self.into_option().unwrap_or_default()
    }
}

struct Slot<V> {
    value: Option<V>,
    fetched_at: Option<Instant>,
    /// Present while a refresh runs; closes when the leader finishes.
    in_flight: Option<watch::Receiver<()>>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self { value: None, fetched_at: None, in_flight: None }
    }
}

enum Plan<V> {
    Hit(V),
    Wait(watch::Receiver<()>),
    Lead(watch::Sender<()>, Option<V>),
}

/// TTL cache with single-flight refresh per key.
pub struct CoalescingCache<K, V> {
    name: &'static str,
    slots: Mutex<HashMap<K, Slot<V>>>,
    wait_timeout: Duration,
}

impl<K: Eq + Hash, V> CoalescingCache<K, V> {
    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    /// `name` labels log lines and metrics.
    pub fn new(name: &'static str, wait_timeout: Duration) -> Self {
        Self { name, slots: Mutex::new(HashMap::new()), wait_timeout }
    }

    /// Serve `key` from cache, refreshing it through `refresh` when missing
    /// or older than `ttl`.
    ///
    /// `refresh` receives the current (possibly stale) value so it can patch
    /// partial upstream results. Its errors are logged and absorbed.
    pub async fn get_or_refresh<F, Fut>(&self, key: K, ttl: Duration, refresh: F) -> Served<V>
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let plan = {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_default();
            match slot.fresh_value(ttl) {
                | Some(v) => Plan::Hit(v),
                | None => match &slot.in_flight {
                    | Some(rx) => Plan::Wait(rx.clone()),
                    | None => {
                        let (tx, rx) = watch::channel(());
                        slot.in_flight = Some(rx);
                        Plan::Lead(tx, slot.value.clone())
                    }
                },
            }
        };

        match plan {
            | Plan::Hit(v) => {
                metrics::counter!("cache_hits_total", "cache" => self.name).increment(1);
                debug!(cache = self.name, ?key, "cache hit");
                Served::Hit(v)
            }
            | Plan::Wait(rx) => self.wait_for_flight(key, ttl, rx).await,
            | Plan::Lead(tx, previous) => {
                metrics::counter!("cache_misses_total", "cache" => self.name).increment(1);
                info!(cache = self.name, ?key, "refreshing");
                let flight = Flight { cache: self, key: Some(key), _done: tx };
                let outcome = refresh(previous).await;
                flight.finish(outcome)
            }
        }
    }

    async fn wait_for_flight(&self, key: K, ttl: Duration, mut rx: watch::Receiver<()>) -> Served<V> {
        metrics::counter!("cache_coalesced_waits_total", "cache" => self.name).increment(1);
        debug!(cache = self.name, ?key, "waiting on in-flight refresh");
        // nothing is ever sent; `changed` resolves with an error once the
        // leader drops its sender
        if tokio::time::timeout(self.wait_timeout, rx.changed()).await.is_err() {
            warn!(cache = self.name, ?key, "timed out waiting on in-flight refresh");
        }

        let slots = self.slots();
        let Some(slot) = slots.get(&key) else {
            return Served::Empty;
        };
        match (slot.fresh_value(ttl), slot.value.clone()) {
            | (Some(v), _) => Served::Hit(v),
            | (None, Some(v)) => self.stale(v),
            | (None, None) => Served::Empty,
        }
    }

    fn stale(&self, v: V) -> Served<V> {
        metrics::counter!("cache_stale_served_total", "cache" => self.name).increment(1);
        Served::Stale(v)
    }

    /// When the value for `key` was last refreshed successfully.
    pub fn fetched_at(&self, key: &K) -> Option<Instant> {
        self.slots().get(key).and_then(|s| s.fetched_at)
    }

    /// Whether a refresh for `key` is currently running.
    pub fn is_refreshing(&self, key: &K) -> bool {
        self.slots().get(key).map_or(false, |s| s.in_flight.is_some())
    }

    /// Number of keys ever looked up.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Slot<V> {
    fn fresh_value(&self, ttl: Duration) -> Option<V> {
        match (&self.value, self.fetched_at) {
            | (Some(v), Some(at)) if Instant::now().duration_since(at) < ttl => Some(v.clone()),
            | _ => None,
        }
    }
}

/// The leader's claim on a key. Dropping it without `finish` (the request
/// future was cancelled) clears the in-flight marker; dropping the sender
/// wakes every waiter either way.
struct Flight<'a, K: Eq + Hash, V> {
    cache: &'a CoalescingCache<K, V>,
    key: Option<K>,
    _done: watch::Sender<()>,
}

impl<'a, K, V> Flight<'a, K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn finish(mut self, outcome: Result<V>) -> Served<V> {
        let Some(key) = self.key.take() else {
            return Served::Empty;
        };
        let cache = self.cache;
        let mut slots = cache.slots();
        let slot = slots.entry(key.clone()).or_default();
        slot.in_flight = None;
        match outcome {
            | Ok(v) => {
                slot.value = Some(v.clone());
                slot.fetched_at = Some(Instant::now());
                Served::Refreshed(v)
            }
            | Err(e) => {
                if e.is_transient() {
                    warn!(cache = cache.name, ?key, error = %e, "refresh failed, keeping cached value");
                } else {
                    error!(cache = cache.name, ?key, error = %e, "refresh failed, keeping cached value");
                }
                match slot.value.clone() {
                    | Some(v) => cache.stale(v),
                    | None => Served::Empty,
                }
            }
        }
    }
}

impl<'a, K: Eq + Hash, V> Drop for Flight<'a, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(slot) = self.cache.slots().get_mut(&key) {
                slot.in_flight = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(90);

    fn cache() -> CoalescingCache<ResourceKey, u32> {
        CoalescingCache::new("test", Duration::from_secs(5))
    }

    async fn prime(c: &CoalescingCache<ResourceKey, u32>, v: u32) {
        let served = c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async move { Ok(v) }).await;
        assert_eq!(served, Served::Refreshed(v));
    }

    #[tokio::test(start_paused = true)]
    async fn hit_inside_ttl_refresh_after() {
        let c = cache();
        let calls = AtomicUsize::new(0);
        prime(&c, 1).await;

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        let served = c
            .get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await;
        assert_eq!(served, Served::Hit(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(2)).await;
        let served = c
            .get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await;
        assert_eq!(served, Served::Refreshed(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_refresh() {
        let c = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |c: Arc<CoalescingCache<ResourceKey, u32>>, calls: Arc<AtomicUsize>| async move {
            c.get_or_refresh(ResourceKey::History { coin: "bitcoin".into() }, TTL, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(7)
            })
            .await
        };

        let (a, b, d) = tokio::join!(
            fetch(c.clone(), calls.clone()),
            fetch(c.clone(), calls.clone()),
            fetch(c.clone(), calls.clone()),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Served::Refreshed(7));
        assert_eq!(b, Served::Hit(7));
        assert_eq!(d, Served::Hit(7));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_value() {
        let c = cache();
        prime(&c, 1).await;
        let before = c.fetched_at(&ResourceKey::MarketSnapshot);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let served = c
            .get_or_refresh(ResourceKey::MarketSnapshot, TTL, |prev| async move {
                assert_eq!(prev, Some(1));
                Err::<u32, _>(Error::RateLimited)
            })
            .await;

        assert_eq!(served, Served::Stale(1));
        assert_eq!(c.fetched_at(&ResourceKey::MarketSnapshot), before);
        assert!(!c.is_refreshing(&ResourceKey::MarketSnapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_nothing_cached_is_empty_and_retryable() {
        let c = cache();
        let key = ResourceKey::RiskMetrics { days: 30 };
        let served = c
            .get_or_refresh(key.clone(), TTL, |_| async { Err::<u32, _>(Error::NetworkTimeout) })
            .await;
        assert_eq!(served, Served::Empty);
        assert_eq!(served.into_value(), 0);
        assert_eq!(c.fetched_at(&key), None);

        // the failed attempt left no in-flight marker behind
        let served = c.get_or_refresh(key, TTL, |_| async { Ok(3) }).await;
        assert_eq!(served, Served::Refreshed(3));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_to_stale_value() {
        let c = Arc::new(cache());
        prime(&c, 1).await;
        tokio::time::advance(TTL).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let leader = {
            let c = c.clone();
            tokio::spawn(async move {
                c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(2)
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let calls = AtomicUsize::new(0);
        let waiter = c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });
        assert_eq!(waiter.await, Served::Stale(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(c.is_refreshing(&ResourceKey::MarketSnapshot));

        assert_eq!(leader.await.unwrap(), Served::Refreshed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_behind_failed_refresh_gets_stale_value() {
        let c = Arc::new(cache());
        prime(&c, 1).await;
        tokio::time::advance(TTL).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let leader = {
            let c = c.clone();
            tokio::spawn(async move {
                c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Err::<u32, _>(Error::RateLimited)
                })
                .await
            })
        };
        started_rx.await.unwrap();

        let calls = AtomicUsize::new(0);
        let waiter = c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });
        let started = Instant::now();
        assert_eq!(waiter.await, Served::Stale(1));
        // woken by the failure, well before the wait timeout
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(leader.await.unwrap(), Served::Stale(1));
        assert!(!c.is_refreshing(&ResourceKey::MarketSnapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_key() {
        let c = cache();
        let slow = c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });
        assert!(tokio::time::timeout(Duration::from_secs(1), slow).await.is_err());
        assert!(!c.is_refreshing(&ResourceKey::MarketSnapshot));

        let served = c.get_or_refresh(ResourceKey::MarketSnapshot, TTL, |_| async { Ok(9) }).await;
        assert_matches!(served, Served::Refreshed(9));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let c = cache();
        prime(&c, 1).await;
        let served = c
            .get_or_refresh(ResourceKey::RiskMetrics { days: 90 }, TTL, |prev| async move {
                assert_eq!(prev, None);
                Ok(5)
            })
            .await;
        assert_eq!(served, Served::Refreshed(5));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn ttl_follows_resource_kind() {
        let cfg = CacheConfig::default();
        assert_eq!(ResourceKey::MarketSnapshot.ttl(&cfg), Duration::from_secs(90));
        assert_eq!(ResourceKey::History { coin: "x".into() }.ttl(&cfg), Duration::from_secs(300));
        assert_eq!(ResourceKey::RiskMetrics { days: 30 }.ttl(&cfg), Duration::from_secs(300));
    }
}
