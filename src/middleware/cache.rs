use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use crate::task::TaskSlot;

pub const DEFAULT_MAX_SIZE: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Shortest sweep period; smaller values are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Sizing and expiry settings for a [`TtlCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held at once. A cache always holds at
    /// least one entry, so `0` is treated as `1`.
    pub max_size: usize,
    /// Age after which an entry is treated as absent.
    pub ttl: Duration,
    /// Period of the background sweep started by
    /// [`TtlCache::start_sweeper`]. At least [`MIN_SWEEP_INTERVAL`].
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Point-in-time counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that were hits, one decimal.
    pub hit_rate: f64,
    /// TTL in milliseconds.
    pub ttl: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

struct CacheState<V> {
    entries: HashMap<String, Entry<V>>,
    /// Insertion sequence -> key. The first element is the oldest insertion.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    max_size: usize,
    ttl: Duration,
}

impl<V: Clone> CacheState<V> {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
            max_size: max_size.max(1),
            ttl,
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.ttl
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            self.remove(key);
            self.misses += 1;
            return None;
        }
        self.hits += 1;
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn set(&mut self, key: String, value: V, now: Instant) {
        if let Some(previous) = self.entries.remove(&key) {
            self.order.remove(&previous.seq);
        } else if self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                seq,
            },
        );
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry.value)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.hits = 0;
        self.misses = 0;
    }

    fn sweep(&mut self, now: Instant) -> usize {
        // Insertion order is also timestamp order, so expired entries form
        // a prefix of `order`.
        let mut removed = 0;
        while let Some((&seq, key)) = self.order.first_key_value() {
            let expired = self
                .entries
                .get(key)
                .is_none_or(|entry| self.is_expired(entry, now));
            if !expired {
                break;
            }
            if let Some(key) = self.order.remove(&seq) {
                self.entries.remove(&key);
            }
            removed += 1;
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / lookups as f64 * 1000.0).round() / 10.0
        };
        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            ttl: self.ttl.as_millis() as u64,
        }
    }
}

struct Shared<V> {
    state: Mutex<CacheState<V>>,
    sweep_interval: Duration,
    sweeper: TaskSlot,
}

impl<V> Shared<V> {
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded key/value cache with time-based expiry.
///
/// Holds at most `max_size` entries. When a new key would overflow the cache
/// the oldest *inserted* entry is evicted; reads never refresh an entry's
/// position. Entries older than `ttl` are never returned: they are dropped
/// lazily by [`get`](Self::get) and eagerly by the background sweeper, so
/// keys that are never looked up again still release their memory.
///
/// Cheaply cloneable; clones share the same entries. The sweeper stops when
/// [`stop`](Self::stop) is called or the last clone is dropped.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use specular_gate::middleware::{CacheConfig, TtlCache};
///
/// let cache = TtlCache::new(CacheConfig {
///     max_size: 2,
///     ttl: Duration::from_secs(1),
///     ..Default::default()
/// });
/// cache.set("a", 1);
/// cache.set("b", 2);
/// cache.set("c", 3);
/// assert_eq!(cache.get("a"), None);
/// assert_eq!(cache.get("c"), Some(3));
/// ```
pub struct TtlCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState::new(config.max_size, config.ttl)),
                sweep_interval: config.sweep_interval.max(MIN_SWEEP_INTERVAL),
                sweeper: TaskSlot::default(),
            }),
        }
    }

    /// Look up `key`. Returns `None` if it is absent or expired; an expired
    /// entry is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        self.shared.lock().get(key, Instant::now())
    }

    /// Insert or overwrite `key`, stamping it with the current time.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.shared.lock().set(key.into(), value, Instant::now());
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shared.lock().remove(key)
    }

    /// Drop every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        self.shared.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.lock().stats()
    }

    /// Remove all expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.shared.lock().sweep(Instant::now())
    }

    /// Start the periodic sweep. Must be called within a tokio runtime.
    /// Restarts the sweeper if it is already running.
    pub fn start_sweeper(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = self.shared.sweep_interval;
        self.shared.sweeper.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let removed = shared.lock().sweep(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cache entries");
                }
            }
        });
    }

    /// Stop the background sweep. Entries are kept.
    pub fn stop(&self) {
        self.shared.sweeper.stop();
    }

    pub fn is_sweeping(&self) -> bool {
        self.shared.sweeper.is_running()
    }
}
