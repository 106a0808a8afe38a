//! Keyed cache with per-entry TTL, optional refresh, and atomic statistics
//!
//! Expired entries are never observable: `get` evicts them lazily, and an
//! optional background sweep removes them without waiting for a lookup.

use crate::resilience::clock::{Clock, MonotonicClock};
use crate::shutdown::ShutdownToken;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    refreshes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub refreshes: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: u64,
    ttl: Duration,
    refresh_after: Option<Duration>,
}

impl<V> Entry<V> {
    fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.inserted_at) > self.ttl.as_millis() as u64
    }

    fn wants_refresh(&self, now: u64) -> bool {
        match self.refresh_after {
            Some(after) => now.saturating_sub(self.inserted_at) > after.as_millis() as u64,
            None => false,
        }
    }
}

/// TTL cache keyed by `K`. Values are cloned out on read.
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    default_ttl: Duration,
    refresh_after: Option<Duration>,
    stats: Arc<CacheStats>,
    clock: Arc<dyn Clock>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            default_ttl: self.default_ttl,
            refresh_after: self.refresh_after,
            stats: self.stats.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
            refresh_after: None,
            stats: Arc::new(CacheStats::default()),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Entries older than `refresh_after` (but inside TTL) are re-loaded by
    /// [`get_or_load`](Self::get_or_load).
    pub fn with_refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = Some(refresh_after);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            inserted_at: self.clock.now_millis(),
            ttl,
            refresh_after: self.refresh_after,
        };
        self.entries.write().unwrap_or_else(|p| p.into_inner()).insert(key, entry);
    }

    /// Look up `key`. Never returns an expired value; expired entries are
    /// evicted on the spot and count as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();

        {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(key) {
                Some(entry) if !entry.expired(now) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: evict under the write lock, re-checking first
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get(key) {
            if entry.expired(now) {
                entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Fetch from the cache, or populate it by running `load`. Entries past
    /// their refresh point are re-loaded; if the re-load fails the stale
    /// (still unexpired) value is served.
    pub async fn get_or_load<E, Fut>(
        &self,
        key: K,
        load: impl FnOnce() -> Fut,
    ) -> Result<V, E>
    where
        Fut: std::future::Future<Output = Result<V, E>>,
        E: std::fmt::Display,
    {
        let now = self.clock.now_millis();
        let (cached, wants_refresh) = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(&key) {
                Some(entry) if !entry.expired(now) => {
                    (Some(entry.value.clone()), entry.wants_refresh(now))
                }
                _ => (None, false),
            }
        };

        match cached {
            Some(value) if !wants_refresh => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Some(stale) => match load().await {
                Ok(fresh) => {
                    self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                    self.insert(key, fresh.clone());
                    Ok(fresh)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cache refresh failed, serving stale value");
                    Ok(stale)
                }
            },
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let fresh = load().await?;
                self.insert(key, fresh.clone());
                Ok(fresh)
            }
        }
    }

    pub fn invalidate(&self, key: &K) {
        if self.entries.write().unwrap_or_else(|p| p.into_inner()).remove(key).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        self.stats.evictions.fetch_add(entries.len() as u64, Ordering::Relaxed);
        entries.clear();
    }

    /// Remove every expired entry now.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        let evicted = before - entries.len();
        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Periodically sweep expired entries until shutdown.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: ShutdownToken) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "cache sweep");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
