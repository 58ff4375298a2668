/// Short tier: ephemeral working memory.
///
/// Holds payload bytes in RAM with a TTL and an LRU bound on entry count.
/// Best-effort by contract: contents do not survive a restart, and the
/// store may evict the least-recently-used entry to admit a new one. The
/// registry reconciles evictions and expiries into proper audited prunes;
/// this store only reports them.
///
/// ## Eviction Policy
///
/// LRU (Least Recently Used): when the store is full, expired entries are
/// reclaimed first; otherwise the entry that has not been accessed longest
/// is evicted and returned to the caller.
use crate::config::ShortTierConfig;
use crate::error::{EngramError, EngramResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One cached payload with its expiry deadline.
#[derive(Debug, Clone)]
struct ShortEntry {
    payload: Arc<[u8]>,
    expires_at: DateTime<Utc>,
}

/// An entry pushed out to make room for a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedShort {
    pub key: String,
    pub size: u64,
}

/// The ephemeral key-value store backing the Short tier.
pub struct ShortStore {
    config: ShortTierConfig,

    /// TTL applied to every entry at insert
    ttl: Duration,

    /// key -> entry
    entries: DashMap<String, ShortEntry>,

    /// Access order for LRU (front = most recent)
    access_order: std::sync::Mutex<VecDeque<String>>,

    /// Statistics
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
}

impl ShortStore {
    /// Create a store with the given entry bound and TTL.
    pub fn new(config: ShortTierConfig, ttl: Duration) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            ttl,
            entries: DashMap::with_capacity(capacity),
            access_order: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    /// Insert a payload under `key`.
    ///
    /// Returns the LRU entry evicted to make room, if any. Oversized
    /// payloads are refused with `CapacityExceeded` (the physical bound of
    /// this backing store, not the logical quota).
    pub fn put(&self, key: &str, payload: &[u8]) -> EngramResult<Option<EvictedShort>> {
        if payload.len() as u64 > self.config.max_value_size {
            return Err(EngramError::CapacityExceeded {
                tier: "short".to_string(),
            });
        }

        let replacing = self.entries.contains_key(key);
        let needs_room = !replacing && self.entries.len() >= self.config.capacity;

        let evicted = if needs_room {
            // Reclaim an expired entry before sacrificing a live one.
            let victim = self
                .expired_keys()
                .into_iter()
                .next()
                .or_else(|| self.least_recent());
            victim.and_then(|k| self.remove_entry(&k))
        } else {
            None
        };

        if evicted.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.entries.insert(
            key.to_string(),
            ShortEntry {
                payload: Arc::from(payload.to_vec().into_boxed_slice()),
                expires_at: Utc::now() + self.ttl,
            },
        );
        self.update_lru(key);

        Ok(evicted)
    }

    /// Get a payload. Expired entries read as absent but stay resident
    /// until the registry sweeps them, so quota accounting never drifts.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = match self.entries.get(key) {
            Some(entry) => entry.clone(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.expires_at <= Utc::now() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.update_lru(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.payload.to_vec())
    }

    /// Remove an entry, returning its payload size.
    pub fn delete(&self, key: &str) -> Option<u64> {
        self.remove_entry(key).map(|e| e.size)
    }

    /// Whether a live (unexpired) entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.expires_at > Utc::now())
            .unwrap_or(false)
    }

    /// Whether any entry (live or expired) exists for `key`.
    pub fn contains_any(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys whose TTL has elapsed, for the registry's expiry sweep.
    pub fn expired_keys(&self) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect()
    }

    /// All resident keys, for the reconciliation scan.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store statistics.
    pub fn stats(&self) -> ShortStoreStats {
        ShortStoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.config.capacity,
        }
    }

    /// Move `key` to the most-recent position.
    fn update_lru(&self, key: &str) {
        if let Ok(mut order) = self.access_order.lock() {
            order.retain(|x| x != key);
            order.push_front(key.to_string());
        }
    }

    /// The least-recently-used key, if any.
    fn least_recent(&self) -> Option<String> {
        let order = self.access_order.lock().ok()?;
        order.back().cloned()
    }

    fn remove_entry(&self, key: &str) -> Option<EvictedShort> {
        let (key, entry) = self.entries.remove(key)?;
        if let Ok(mut order) = self.access_order.lock() {
            order.retain(|x| x != &key);
        }
        Some(EvictedShort {
            size: entry.payload.len() as u64,
            key,
        })
    }
}

/// Short store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortStoreStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub current_size: usize,
    pub capacity: usize,
}

impl ShortStoreStats {
    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate utilization (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64
        }
    }
}
