//! L1 Cache - In-Memory Hot Tier
//!
//! Bounded, TTL-aware key/value store. Fastest tier, volatile, and the first
//! one consulted on every read.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the map and the running byte total, so
//!   the read-check-evict-write sequence of `set` is a single critical section
//! - Capacity pressure evicts down to 80% of the budget using the tier's
//!   configured strategy, evaluated on the tier's own bookkeeping
//! - Expired entries are dropped lazily on access and by a periodic sweep

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::entry::{now_ms, CacheEntry, EntryMetadata, KeyFilter, DEFAULT_PRIORITY};
use super::policy::{EvictionCandidate, EvictionPolicy, EvictionStrategy, EvictionTarget, TierUsage};
use super::stats::{Tier, TierCounters, TierStats};
use crate::error::Result;

/// L1 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Byte budget in MB
    pub max_size_mb: f64,
    /// TTL applied when the caller gives none; also caps mirrored TTLs
    pub default_ttl_ms: u64,
    /// Strategy used under capacity pressure
    pub eviction_policy: EvictionStrategy,
    /// Fraction of the budget to free down to under pressure
    pub eviction_target: f64,
    /// Expiry sweep period
    pub cleanup_interval_secs: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100.0,
            default_ttl_ms: 60 * 60 * 1000,
            eviction_policy: EvictionStrategy::Lru,
            eviction_target: 0.80,
            cleanup_interval_secs: 60,
        }
    }
}

impl MemoryCacheConfig {
    pub fn max_bytes(&self) -> u64 {
        (self.max_size_mb.max(0.0) * 1024.0 * 1024.0) as u64
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Access order; larger = more recent
    sequence: u64,
}

#[derive(Debug, Default)]
struct L1State {
    entries: HashMap<String, Slot>,
    used_bytes: u64,
    sequence: u64,
}

impl L1State {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size());
        Some(slot.entry)
    }

    fn remove_expired(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.metadata.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn candidates(&self, filter: &KeyFilter) -> Vec<EvictionCandidate> {
        self.entries
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(key, slot)| EvictionCandidate::from_metadata(key.as_str(), &slot.entry.metadata, slot.sequence))
            .collect()
    }
}

/// L1 Cache - in-memory hot tier
pub struct MemoryCache {
    config: MemoryCacheConfig,
    max_bytes: u64,
    policy: EvictionPolicy,
    state: Mutex<L1State>,
    counters: TierCounters,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_bytes", &self.max_bytes)
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl MemoryCache {
    /// Create a new L1 cache with the default eviction policy
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self::with_policy(config, EvictionPolicy::default())
    }

    /// Create a new L1 cache with a custom eviction policy
    pub fn with_policy(config: MemoryCacheConfig, policy: EvictionPolicy) -> Self {
        Self {
            max_bytes: config.max_bytes(),
            config,
            policy,
            state: Mutex::new(L1State::default()),
            counters: TierCounters::new(),
        }
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Get a value; expired entries are deleted and reported as a miss
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_with(key, |_| {})
    }

    /// Get a value, letting `update` modify the stored copy on a hit
    ///
    /// The entry keeps the size measured when it was inserted.
    pub fn get_with(&self, key: &str, update: impl FnOnce(&mut Value)) -> Option<Value> {
        let now = now_ms();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                self.counters.record_miss();
                return None;
            }
            Some(slot) => slot.entry.metadata.is_expired_at(now),
        };

        if expired {
            state.remove(key);
            self.counters.record_expired(1);
            self.counters.record_miss();
            debug!(category = "cache.l1", "Expired on read: {}", key);
            return None;
        }

        let sequence = state.next_sequence();
        let slot = state.entries.get_mut(key)?;
        slot.entry.metadata.record_access(now);
        slot.sequence = sequence;
        update(&mut slot.entry.value);
        self.counters.record_hit();
        Some(slot.entry.value.clone())
    }

    /// Insert with the default priority
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        self.set_with_priority(key, value, ttl, DEFAULT_PRIORITY)
    }

    /// Insert or replace an entry
    ///
    /// Returns false (without side effects) when the value alone is larger
    /// than the whole budget. `None` TTL means the tier default.
    pub fn set_with_priority(&self, key: &str, value: Value, ttl: Option<Duration>, priority: u8) -> bool {
        let ttl = ttl.or_else(|| Some(self.config.default_ttl()));
        let entry = match CacheEntry::new(value, ttl, priority) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.record_error();
                warn!(category = "cache.l1", "Cannot store {}: {}", key, e);
                return false;
            }
        };

        let size = entry.size();
        if size > self.max_bytes {
            debug!(
                category = "cache.l1",
                "Rejected {}: {} bytes exceeds budget of {}", key, size, self.max_bytes
            );
            return false;
        }

        let mut state = self.state.lock();
        state.remove(key);

        if state.used_bytes + size > self.max_bytes {
            self.make_room(&mut state, size);
        }

        let sequence = state.next_sequence();
        state.used_bytes += size;
        state.entries.insert(key.to_string(), Slot { entry, sequence });
        self.counters.record_set();
        true
    }

    /// Free space down to the eviction target (and at least enough for `incoming`)
    fn make_room(&self, state: &mut L1State, incoming: u64) {
        let now = now_ms();
        let expired = state.remove_expired(now);
        if expired > 0 {
            self.counters.record_expired(expired as u64);
        }

        let target = ((self.max_bytes as f64 * self.config.eviction_target) as u64)
            .min(self.max_bytes.saturating_sub(incoming));
        if state.used_bytes <= target {
            return;
        }

        let candidates = state.candidates(&KeyFilter::all());
        let plan = self
            .policy
            .plan_bytes(self.config.eviction_policy, candidates, state.used_bytes, target, now);
        for candidate in &plan {
            state.remove(&candidate.key);
        }
        self.counters.record_evictions(plan.len() as u64);
        debug!(
            category = "cache.evict",
            "L1 evicted {} entries ({}), now {} bytes",
            plan.len(),
            self.config.eviction_policy,
            state.used_bytes
        );
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.counters.record_delete();
        }
        removed
    }

    /// Live (non-expired) entry present?
    pub fn exists(&self, key: &str) -> bool {
        let now = now_ms();
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return false,
            Some(slot) => slot.entry.metadata.is_expired_at(now),
        };
        if expired {
            state.remove(key);
            self.counters.record_expired(1);
        }
        !expired
    }

    /// Remove every entry passing the filter
    pub fn clear(&self, filter: &KeyFilter) -> usize {
        let mut state = self.state.lock();
        if filter.is_unrestricted() {
            let count = state.entries.len();
            state.entries.clear();
            state.used_bytes = 0;
            return count;
        }

        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    /// Best-effort batch insert, returns how many were stored
    pub fn set_multiple(&self, entries: Vec<(String, Value, Option<Duration>)>) -> usize {
        entries
            .into_iter()
            .filter(|(key, value, ttl)| self.set(key, value.clone(), *ttl))
            .count()
    }

    /// Drop every expired entry
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.state.lock().remove_expired(now_ms());
        if removed > 0 {
            self.counters.record_expired(removed as u64);
            debug!(category = "cache.l1", "Swept {} expired entries", removed);
        }
        removed
    }

    /// Run `cleanup_expired` every `cleanup_interval` until cancelled
    pub fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.cleanup_interval();
        tokio::spawn(async move { self.cleanup_loop(period, shutdown).await })
    }

    #[instrument(skip(self, shutdown), name = "l1_cleanup")]
    async fn cleanup_loop(&self, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.cleanup_expired();
                }
            }
        }
    }

    /// Metadata of a live entry
    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|slot| slot.entry.metadata.clone())
    }

    /// Keys passing the filter
    pub fn keys(&self, filter: &KeyFilter) -> Vec<String> {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> TierStats {
        let (entries, used) = {
            let state = self.state.lock();
            (state.entries.len(), state.used_bytes)
        };
        self.counters.snapshot(Tier::L1, entries, used, self.max_bytes)
    }

    pub fn is_healthy(&self) -> bool {
        self.stats().is_healthy()
    }
}

#[async_trait]
impl EvictionTarget for MemoryCache {
    fn tier_name(&self) -> &'static str {
        "L1"
    }

    fn eviction_candidates(&self, filter: &KeyFilter) -> Vec<EvictionCandidate> {
        self.state.lock().candidates(filter)
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            used_bytes: self.used_bytes(),
            max_bytes: self.max_bytes,
            hit_ratio: self.counters.hit_ratio(),
        }
    }

    async fn evict_key(&self, key: &str) -> Result<bool> {
        let removed = self.state.lock().remove(key).is_some();
        if removed {
            self.counters.record_evictions(1);
        }
        Ok(removed)
    }
}
