//! Generic TTL cache with single-flight population.
//!
//! Used for both cache tiers: upstream metadata (version tokens, long TTL)
//! and rendered output (feed documents, short TTL).
//!
//! ## Guarantees
//!
//! - An entry read at or after `stored_at + ttl` is a miss and is purged.
//! - No lock is held while a populating future runs.
//! - Concurrent misses for one key share a single populating call; every
//!   waiter receives its result, errors included.
//! - A population whose key was invalidated while it ran never stores its
//!   value; populations for other keys are unaffected.
//! - A panicking population resolves as an error for every waiter.
//!
//! Lock order is always `entries` before `in_flight`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppError, Result};

type Flight<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<AppError>>>>;

struct Entry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined an already running population
    pub coalesced: u64,
}

struct Inner<V> {
    name: &'static str,
    entries: RwLock<HashMap<String, Entry<V>>>,
    in_flight: Mutex<HashMap<String, (u64, Flight<V>)>>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl<V> Inner<V> {
    // A poisoned lock only means another thread panicked mid-update; the map
    // itself is still usable, and the worst outcome is a recomputed entry.
    fn flights(&self) -> MutexGuard<'_, HashMap<String, (u64, Flight<V>)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feedhub_cache_hits_total", "tier" => self.name).increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feedhub_cache_misses_total", "tier" => self.name).increment(1);
    }
}

impl<V: Clone> Inner<V> {
    fn complete(
        &self,
        key: &str,
        flight_id: u64,
        ttl: Duration,
        result: &std::result::Result<V, Arc<AppError>>,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut flights = self.flights();
        // Invalidation detaches flights under the entries lock, so a flight
        // still registered here has not been invalidated.
        let registered = matches!(flights.get(key), Some((id, _)) if *id == flight_id);
        if !registered {
            log::debug!(
                "cache[{}]: dropping value for {} invalidated while populating",
                self.name,
                key
            );
            return;
        }
        flights.remove(key);
        if let Ok(value) = result {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.clone(),
                    stored_at: Instant::now(),
                    ttl,
                },
            );
        }
    }
}

/// Thread-safe TTL cache. Cloning shares the underlying storage.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create an empty cache; `name` labels its log lines and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Return a live value, purging the entry if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self
                .inner
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.inner.record_hit();
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.inner.record_miss();
                    return None;
                }
            }
        }

        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        self.inner.record_miss();
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.into(),
            Entry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// Running populations for matching keys are detached: they still answer
    /// their current waiters but will not store their value.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let removed = {
            let mut entries = self
                .inner
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.flights().retain(|k, _| !k.starts_with(prefix));
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            before - entries.len()
        };

        if removed > 0 {
            log::debug!(
                "cache[{}]: invalidated {} entries with prefix '{}'",
                self.inner.name,
                removed,
                prefix
            );
        }
        removed
    }

    /// Remove one key exactly, detaching a running population for it.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.flights().remove(key);
        entries.remove(key).is_some()
    }

    /// Remove every entry and detach every running population.
    pub fn invalidate_all(&self) {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.flights().clear();
        entries.clear();
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Spawn a task purging expired entries every `interval`.
    ///
    /// The task ends on its own once every handle to the cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let purged = inner.purge_expired();
                if purged > 0 {
                    log::debug!("cache[{}]: swept {} expired entries", inner.name, purged);
                }
            }
        })
    }

    /// Return the cached value or populate it once for all concurrent callers.
    ///
    /// Errors, panics included, are handed to every waiter and never cached.
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        populate: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        if let Some(flight) = self.join_flight(key) {
            return flight.await.map_err(AppError::Shared);
        }

        let flight_id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let fut = populate();
        let flight: Flight<V> = async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result.map_err(Arc::new),
                Err(payload) => Err(Arc::new(AppError::from_panic(payload))),
            };
            inner.complete(&owned_key, flight_id, ttl, &result);
            result
        }
        .boxed()
        .shared();

        let flight = {
            let mut flights = self.inner.flights();
            match flights.get(key) {
                // Lost the race to another caller; ours is dropped unpolled.
                Some((_, existing)) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                }
                None => {
                    flights.insert(key.to_string(), (flight_id, flight.clone()));
                    flight
                }
            }
        };

        flight.await.map_err(AppError::Shared)
    }

    fn join_flight(&self, key: &str) -> Option<Flight<V>> {
        let flights = self.inner.flights();
        flights.get(key).map(|(_, flight)| {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            flight.clone()
        })
    }
}
