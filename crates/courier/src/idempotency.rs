//! Bounded, TTL-aware LRU store used to deduplicate request processing.
//!
//! Every entry expires after its own TTL (never more than [`MAX_TTL`]) and the
//! least-recently-touched entry is evicted once the store is full. Expired
//! entries are reported absent the moment they are read, and a periodic sweep
//! removes the ones nobody reads.
//!
//! # Locking
//!
//! The store sits behind a single `RwLock`. Size, stats and `contains` share
//! the read lock. Anything that reorders the recency index (including `get`)
//! takes the write lock.
//!
//! # Example
//!
//! ```ignore
//! let store = IdempotencyStore::new(StoreConfig::default());
//! store.put("req-1", response.clone());
//! assert_eq!(store.get("req-1"), Some(response));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Hard ceiling applied to every TTL.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Store sizing and expiry settings.
///
/// # Defaults
///
/// - `max_size`: 500
/// - `default_ttl`: 1 hour
/// - `sweep_interval`: 5 minutes
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            default_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl StoreConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl.min(MAX_TTL);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreStats {
    pub current_size: usize,
    pub max_size: usize,
    pub total_evictions: u64,
    pub total_expirations: u64,
    pub fill_percentage: f64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IdempotencyStore[size={}/{} ({:.1}%), evictions={}, expirations={}]",
            self.current_size,
            self.max_size,
            self.fill_percentage,
            self.total_evictions,
            self.total_expirations
        )
    }
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    /// Position in the recency index.
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Hash map plus a tick-ordered recency index. Lowest tick is least recent.
struct LruMap<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl<V> LruMap<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, id: &str) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(id) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, id.to_string());
        }
    }

    fn insert(&mut self, id: String, value: V, ttl: Duration, now: Instant) {
        self.remove(&id);
        let tick = self.tick();
        self.recency.insert(tick, id.clone());
        self.entries.insert(
            id,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                tick,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(id)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn pop_least_recent(&mut self) -> Option<String> {
        let (_, id) = self.recency.pop_first()?;
        self.entries.remove(&id);
        Some(id)
    }

    fn expired_ids(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

struct StoreInner<V> {
    config: StoreConfig,
    map: RwLock<LruMap<V>>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> StoreInner<V> {
    // A poisoned lock only means another thread panicked mid-operation; the
    // map itself is still structurally valid.
    fn read(&self) -> RwLockReadGuard<'_, LruMap<V>> {
        self.map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LruMap<V>> {
        self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.write();
        let expired = map.expired_ids(now);
        for id in &expired {
            map.remove(id);
        }
        drop(map);

        let removed = expired.len();
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

/// Bounded LRU cache of request results keyed by request id.
///
/// Cloning is cheap; clones share the same entries.
pub struct IdempotencyStore<V> {
    inner: Arc<StoreInner<V>>,
    sweeper: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<V> Clone for IdempotencyStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sweeper: self.sweeper.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> IdempotencyStore<V> {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                map: RwLock::new(LruMap::new()),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
            }),
            sweeper: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Whether a live entry exists. Removes the entry if it has expired.
    pub fn contains(&self, id: &str) -> bool {
        let now = Instant::now();
        {
            let map = self.inner.read();
            match map.entries.get(id) {
                None => return false,
                Some(entry) if !entry.is_expired(now) => return true,
                Some(_) => {}
            }
        }
        self.expire_if_stale(id, now);
        false
    }

    /// Fetch a live entry and mark it most recently used.
    pub fn get(&self, id: &str) -> Option<V> {
        let now = Instant::now();
        let mut map = self.inner.write();
        let expired = map.entries.get(id)?.is_expired(now);
        if expired {
            map.remove(id);
            drop(map);
            self.inner.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "idempotency entry expired on read");
            return None;
        }
        map.touch(id);
        map.entries.get(id).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite with the configured default TTL.
    pub fn put(&self, id: impl Into<String>, value: V) {
        let ttl = self.inner.config.default_ttl;
        self.put_with_ttl(id, value, ttl);
    }

    /// Insert or overwrite with `ttl`, clamped to [`MAX_TTL`].
    ///
    /// Evicts least-recently-used entries until the store fits its bound.
    pub fn put_with_ttl(&self, id: impl Into<String>, value: V, ttl: Duration) {
        let id = id.into();
        let ttl = ttl.min(MAX_TTL);
        let now = Instant::now();

        let mut map = self.inner.write();
        map.insert(id, value, ttl, now);

        let mut evicted = 0u64;
        while map.entries.len() > self.inner.config.max_size {
            match map.pop_least_recent() {
                Some(victim) => {
                    debug!(id = %victim, "evicted least recently used idempotency entry");
                    evicted += 1;
                }
                None => break,
            }
        }
        drop(map);

        if evicted > 0 {
            self.inner.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Age of a live entry.
    pub fn age(&self, id: &str) -> Option<Duration> {
        let now = Instant::now();
        let map = self.inner.read();
        map.entries
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.saturating_duration_since(entry.created_at))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.inner.write().clear();
        self.inner.evictions.store(0, Ordering::Relaxed);
        self.inner.expirations.store(0, Ordering::Relaxed);
    }

    /// Number of stored entries, expired ones excluded.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.read();
        map.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Below 90% of capacity.
    pub fn is_healthy(&self) -> bool {
        (self.len() as f64) < self.inner.config.max_size as f64 * 0.9
    }

    /// Remove all expired entries now. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.inner.purge_expired();
        if removed > 0 {
            debug!(removed, "swept expired idempotency entries");
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let current_size = self.len();
        let max_size = self.inner.config.max_size;
        StoreStats {
            current_size,
            max_size,
            total_evictions: self.inner.evictions.load(Ordering::Relaxed),
            total_expirations: self.inner.expirations.load(Ordering::Relaxed),
            fill_percentage: current_size as f64 * 100.0 / max_size as f64,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Spawn the periodic expiry sweep. Calling it again replaces the running sweep.
    ///
    /// Must be called from within a tokio runtime. The task holds only a weak
    /// reference and exits once every handle to the store is dropped.
    pub fn start_sweeper(&self) {
        let period = self.inner.config.sweep_interval;
        let weak: Weak<StoreInner<V>> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.purge_expired();
                if removed > 0 {
                    debug!(removed, "swept expired idempotency entries");
                }
            }
        });

        let mut slot = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweep and drop every entry.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
        let stats = self.stats();
        self.clear();
        info!(%stats, "idempotency store shut down");
    }

    fn expire_if_stale(&self, id: &str, now: Instant) {
        let mut map = self.inner.write();
        // Re-check under the write lock; the entry may have been replaced.
        let stale = map.entries.get(id).is_some_and(|e| e.is_expired(now));
        if stale {
            map.remove(id);
            drop(map);
            self.inner.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "idempotency entry expired on read");
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for IdempotencyStore<V> {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl<V> fmt::Debug for IdempotencyStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("max_size", &self.inner.config.max_size)
            .field("default_ttl", &self.inner.config.default_ttl)
            .finish_non_exhaustive()
    }
}
