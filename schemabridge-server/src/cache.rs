// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bounded Result Cache
//!
//! Caches tool results keyed by [`CacheKey`](schemabridge_core::CacheKey) so that
//! identical calls skip the handler entirely.
//!
//! ## Expiry
//!
//! An entry is expired once `now - created_at > ttl`. Expired entries are removed
//! lazily on read and eagerly by a sweep task every `sweep_interval`.
//!
//! ## Eviction
//!
//! Inserting a *new* key into a full cache evicts exactly one entry first:
//!
//! | Strategy | Victim                                                       |
//! |----------|--------------------------------------------------------------|
//! | `lru`    | least recently accessed                                      |
//! | `lfu`    | fewest accesses, ties to the least recently accessed         |
//! | `ttl`    | earliest `created_at + ttl`, LRU if no entry carries a ttl   |
//!
//! Recency uses a monotonic access counter rather than wall-clock time, so two
//! accesses within the same instant are still ordered.

use parking_lot::Mutex;
use schemabridge_core::{PerfError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Victim selection policy for a full cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    #[default]
    Lru,
    Lfu,
    Ttl,
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
        })
    }
}

impl FromStr for EvictionStrategy {
    type Err = PerfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "ttl" => Ok(Self::Ttl),
            other => Err(PerfError::invalid_config(format!(
                "unknown eviction strategy: {}",
                other
            ))),
        }
    }
}

/// Configuration for the result cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// TTL applied when `set` is called without one. `None` never expires.
    pub default_ttl: Option<Duration>,
    pub strategy: EvictionStrategy,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(3600)),
            strategy: EvictionStrategy::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PerfError::invalid_config("cache.max_size must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(PerfError::invalid_config(
                "cache.sweep_interval must be positive",
            ));
        }
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(PerfError::invalid_config("cache.default_ttl must be positive"));
        }
        Ok(())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub strategy: EvictionStrategy,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Option<Duration>,
    access_count: u64,
    last_access: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(self.created_at) > ttl)
    }

    fn expires_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.created_at + ttl)
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K: Hash + Eq + Clone, V> CacheState<K, V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn pick_victim(&self, strategy: EvictionStrategy) -> Option<K> {
        let lru = || {
            self.entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
        };

        match strategy {
            EvictionStrategy::Lru => lru(),
            EvictionStrategy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.last_access))
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Ttl => self
                .entries
                .iter()
                .filter_map(|(k, e)| e.expires_at().map(|at| (at, e.last_access, k)))
                .min_by_key(|(at, access, _)| (*at, *access))
                .map(|(_, _, k)| k.clone())
                .or_else(lru),
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - self.entries.len();
        self.expirations += removed as u64;
        removed
    }
}

struct CacheInner<K, V> {
    config: CacheConfig,
    state: Mutex<CacheState<K, V>>,
}

/// Size-bounded, TTL-aware cache with a pluggable eviction strategy.
pub struct BoundedCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache and start its expiry sweep. Must be called from within a
    /// Tokio runtime.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(CacheInner {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        });

        let sweeper = tokio::spawn(sweep_loop(
            Arc::downgrade(&inner),
            inner.config.sweep_interval,
        ));

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up a live entry, counting the access.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.inner.state.lock();
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        let tick = state.tick();
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = tick;
        Some(entry.value.clone())
    }

    /// Insert or overwrite an entry. `ttl` falls back to the configured default.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut state = self.inner.state.lock();
        let strategy = self.inner.config.strategy;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.inner.config.max_size {
            if let Some(victim) = state.pick_victim(strategy) {
                state.entries.remove(&victim);
                state.evictions += 1;
                debug!(key = ?victim, %strategy, "Evicted cache entry");
            }
        }

        let tick = state.tick();
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl: ttl.or(self.inner.config.default_ttl),
                access_count: 1,
                last_access: tick,
            },
        );
    }

    pub fn delete(&self, key: &K) -> bool {
        self.inner.state.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.state.lock().purge_expired(Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            capacity: self.inner.config.max_size,
            strategy: self.inner.config.strategy,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }

    /// Stop the background sweep. Entries stay readable.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl<K, V> Drop for BoundedCache<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

async fn sweep_loop<K, V>(inner: Weak<CacheInner<K, V>>, period: Duration)
where
    K: Hash + Eq + Clone,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let removed = inner.state.lock().purge_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize, strategy: EvictionStrategy) -> BoundedCache<&'static str, u32> {
        BoundedCache::new(CacheConfig {
            max_size,
            default_ttl: Some(Duration::from_secs(3600)),
            strategy,
            sweep_interval: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_used() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert_eq!(cache.get(&"a"), Some(1));

        cache.set("c", 3, None);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("a", 10, None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lfu_evicts_least_frequently_used() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"b");

        cache.set("c", 3, None);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lfu_ties_break_on_oldest_access() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.set("a", 1, None);
        cache.set("b", 2, None);

        cache.set("c", 3, None);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_strategy_evicts_nearest_expiry() {
        let cache = cache(2, EvictionStrategy::Ttl);
        cache.set("long", 1, Some(Duration::from_secs(3600)));
        cache.set("short", 2, Some(Duration::from_secs(60)));
        cache.get(&"long");

        cache.set("c", 3, None);

        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_strategy_falls_back_to_lru() {
        let cache = BoundedCache::new(CacheConfig {
            max_size: 2,
            default_ttl: None,
            strategy: EvictionStrategy::Ttl,
            ..Default::default()
        })
        .unwrap();
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get(&"a");

        cache.set("c", 3, None);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_removed_on_read() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("k", 1, Some(Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_without_ttl_never_expire() {
        let cache = BoundedCache::new(CacheConfig {
            default_ttl: None,
            ..Default::default()
        })
        .unwrap();
        cache.set("k", 1, None);

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_removes_expired() {
        let cache = BoundedCache::new(CacheConfig {
            sweep_interval: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();
        cache.set("gone", 1, Some(Duration::from_millis(10)));
        cache.set("kept", 2, None);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_delete_and_clear() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("a", 1, Some(Duration::from_millis(5)));
        cache.set("b", 2, None);
        cache.set("c", 3, None);

        tokio::time::advance(Duration::from_millis(6)).await;
        assert_eq!(cache.purge_expired(), 1);

        assert!(cache.delete(&"b"));
        assert!(!cache.delete(&"b"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_rate() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("a", 1, None);
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_strategy_parsing_and_validation() {
        assert_eq!("LFU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lfu);
        assert!("fifo".parse::<EvictionStrategy>().is_err());
        assert_eq!(EvictionStrategy::Ttl.to_string(), "ttl");

        let config = CacheConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
