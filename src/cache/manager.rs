//! Cache Manager
//!
//! The single entry point the rest of an application talks to. Owns both
//! tiers, the stats collector, the warmer and the background tasks, and
//! defines the read, promotion and write protocol:
//!
//! ```text
//! get:  L1 ──hit──▶ value
//!        │miss
//!        ▼
//!       L2 ──hit──▶ promote into L1 (admission rule) ──▶ value
//!        │miss
//!        ▼
//!       None
//!
//! set:  L2 (source of truth) ──▶ L1 mirror (admission rule, TTL capped)
//! ```
//!
//! Values are stored wrapped with manager-level metadata (priority, creation
//! time, requested TTL, namespace). Every public operation turns internal
//! errors into a stats record, a warning and a safe default, so a cache
//! failure degrades into a miss instead of failing the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::entry::{
    clamp_priority, full_key, namespace_of, now_ms, serialized_size, KeyFilter, DEFAULT_NAMESPACE,
    DEFAULT_PRIORITY,
};
use super::l1::MemoryCache;
use super::l2::{FileCache, RepairReport};
use super::namespace::NamespacedCache;
use super::policy::{EvictionPolicy, EvictionReport, EvictionRequest, EvictionStrategy};
use super::stats::{
    CacheStats, StatsSnapshot, Tier, TierStats, TIER_MIN_HIT_RATIO, TIER_MIN_LOOKUPS, TIER_USAGE_LIMIT,
};
use super::warmer::{
    CacheWarmer, RecentEntry, RecentEntrySource, WarmEntry, WarmerStats, WarmupSink, WarmupSources,
};
use crate::error::{Error, Result};
use crate::monitoring::{HealthCheckResult, HealthReport};

const VALUE_FIELD: &str = "value";
const METADATA_FIELD: &str = "metadata";

// =============================================================================
// Stored Form
// =============================================================================

/// Manager-level metadata stored next to every value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMetadata {
    pub priority: u8,
    /// Epoch ms
    pub created_at: i64,
    /// TTL requested by the caller (after namespace defaults)
    pub ttl_ms: Option<u64>,
    /// Serialized size of the bare value
    pub size_bytes: u64,
    pub namespace: String,
    /// Reads served for this value
    #[serde(default)]
    pub access_count: u64,
    /// Epoch ms of the last read (creation time until then)
    #[serde(default)]
    pub last_accessed: i64,
}

fn wrap(value: Value, metadata: &ValueMetadata) -> Result<Value> {
    let mut map = Map::with_capacity(2);
    map.insert(VALUE_FIELD.to_string(), value);
    map.insert(METADATA_FIELD.to_string(), serde_json::to_value(metadata)?);
    Ok(Value::Object(map))
}

/// Metadata of a wrapped value, `None` for anything stored bare
pub fn peek_metadata(stored: &Value) -> Option<ValueMetadata> {
    let map = stored.as_object()?;
    if map.len() != 2 || !map.contains_key(VALUE_FIELD) {
        return None;
    }
    ValueMetadata::deserialize(map.get(METADATA_FIELD)?).ok()
}

/// Count a read in the wrapper's metadata; bare values are left alone
fn record_value_access(stored: &mut Value) {
    let Some(mut metadata) = peek_metadata(stored) else {
        return;
    };
    metadata.access_count += 1;
    metadata.last_accessed = now_ms();
    if let (Some(map), Ok(encoded)) = (stored.as_object_mut(), serde_json::to_value(&metadata)) {
        map.insert(METADATA_FIELD.to_string(), encoded);
    }
}

/// Strip the manager wrapper; bare values pass through unchanged
pub fn unwrap_stored(stored: Value) -> (Value, Option<ValueMetadata>) {
    match peek_metadata(&stored) {
        Some(metadata) => match stored {
            Value::Object(mut map) => (map.remove(VALUE_FIELD).unwrap_or(Value::Null), Some(metadata)),
            other => (other, None),
        },
        None => (stored, None),
    }
}

// =============================================================================
// Options and Reports
// =============================================================================

/// Options for [`CacheManager::get`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Prefix the key with `namespace:`
    pub namespace: Option<String>,
    /// Return expired L2 entries instead of treating them as misses
    pub allow_stale: bool,
    pub skip_l1: bool,
    pub skip_l2: bool,
}

impl GetOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// Options for [`CacheManager::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Prefix the key with `namespace:`
    pub namespace: Option<String>,
    /// Priority 0-10; namespace default when `None`
    pub priority: Option<u8>,
    pub skip_l1: bool,
    pub skip_l2: bool,
    /// Compress in L2; the L2 configuration decides when `None`
    pub compression: Option<bool>,
}

impl SetOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Options for [`CacheManager::clear`]
#[derive(Debug, Clone, Default)]
pub struct ClearOptions {
    pub namespace: Option<String>,
    /// Glob (`*`, `?`) over the raw key (full key without a namespace)
    pub pattern: Option<String>,
}

/// Options for [`CacheManager::evict_by_policy`]
#[derive(Debug, Clone, Default)]
pub struct EvictOptions {
    /// Share to evict, 0-100; the configured default when `None`
    pub percentage: Option<f64>,
    pub namespace: Option<String>,
}

/// Both tiers' results of one eviction request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionOutcome {
    pub l1: EvictionReport,
    pub l2: EvictionReport,
}

impl EvictionOutcome {
    pub fn total(&self) -> usize {
        self.l1.evicted + self.l2.evicted
    }
}

/// Merged statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    pub global: StatsSnapshot,
    pub l1: TierStats,
    pub l2: TierStats,
    pub warmer: WarmerStats,
    /// 0-100
    pub health_score: f64,
}

/// Derived 0-100 score penalizing a low hit ratio, full tiers, slow
/// responses and errors
pub fn health_score(config: &CacheConfig, global: &StatsSnapshot, tiers: &[&TierStats]) -> f64 {
    let thresholds = config.stats.thresholds;
    let mut score = 100.0;

    if global.hits + global.misses > 0 && global.hit_ratio < thresholds.hit_ratio {
        score -= ((thresholds.hit_ratio - global.hit_ratio) * 100.0).min(30.0);
    }
    for tier in tiers {
        if tier.usage >= TIER_USAGE_LIMIT {
            score -= 15.0;
        }
    }
    if global.avg_response_ms > thresholds.avg_response_ms {
        score -= 15.0;
    }
    score -= (global.error_rate * 200.0).min(20.0);

    score.clamp(0.0, 100.0)
}

// =============================================================================
// Recent Entries Adapter
// =============================================================================

/// Recent L2 entries with the manager wrapper removed, so replaying them
/// through `set` does not wrap twice
struct UnwrappedRecent {
    l2: Arc<FileCache>,
}

#[async_trait]
impl RecentEntrySource for UnwrappedRecent {
    async fn recent_entries(&self, within: Duration, limit: usize) -> Result<Vec<RecentEntry>> {
        let entries = self.l2.recent_entries(within, limit).await?;
        Ok(entries
            .into_iter()
            .map(|mut entry| {
                let (value, metadata) = unwrap_stored(entry.value);
                entry.value = value;
                if let Some(metadata) = metadata {
                    entry.priority = metadata.priority;
                }
                entry
            })
            .collect())
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Two-tier cache facade
pub struct CacheManager {
    config: CacheConfig,
    l1: Arc<MemoryCache>,
    l2: Arc<FileCache>,
    stats: Arc<CacheStats>,
    warmer: Arc<CacheWarmer>,
    policy: EvictionPolicy,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("l1_entries", &self.l1.len())
            .field("l2_entries", &self.l2.len())
            .field("warmer", &self.warmer)
            .finish()
    }
}

impl CacheManager {
    /// Build with the recent-files warmup only
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_sources(config, WarmupSources::default())
    }

    /// Build with external warmup sources
    ///
    /// The recent-files source defaults to this manager's own L2.
    pub fn with_sources(config: CacheConfig, mut sources: WarmupSources) -> Result<Self> {
        let l2 = Self::build_l2(&config)?;
        if sources.recent.is_none() {
            sources.recent = Some(Arc::new(UnwrappedRecent { l2: l2.clone() }));
        }
        let warmer = Arc::new(CacheWarmer::new(config.warmer.clone(), sources));
        Self::assemble(config, l2, warmer)
    }

    /// Build around an existing warmer
    pub fn with_warmer(config: CacheConfig, warmer: Arc<CacheWarmer>) -> Result<Self> {
        let l2 = Self::build_l2(&config)?;
        Self::assemble(config, l2, warmer)
    }

    fn build_l2(config: &CacheConfig) -> Result<Arc<FileCache>> {
        for warning in config.validate().into_result()? {
            warn!(category = "cache.manager", "Configuration: {}", warning);
        }
        let policy = config.eviction.build_policy()?;
        Ok(Arc::new(FileCache::with_policy(config.l2.clone(), policy)))
    }

    fn assemble(config: CacheConfig, l2: Arc<FileCache>, warmer: Arc<CacheWarmer>) -> Result<Self> {
        let policy = config.eviction.build_policy()?;
        Ok(Self {
            l1: Arc::new(MemoryCache::with_policy(config.l1.clone(), policy.clone())),
            l2,
            stats: Arc::new(CacheStats::new(config.stats)),
            warmer,
            policy,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l1(&self) -> &Arc<MemoryCache> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<FileCache> {
        &self.l2
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the file tier (loading and, if configured, repairing its index)
    pub async fn init(&self) -> Result<()> {
        self.l2.init().await?;
        info!(
            category = "cache.manager",
            "Cache ready: L1 {} MB, L2 {} MB at {}",
            self.config.l1.max_size_mb,
            self.config.l2.max_size_mb,
            self.config.l2.base_dir.display()
        );
        Ok(())
    }

    /// Spawn the background tasks
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!(category = "cache.manager", "Background tasks already running");
            return;
        }

        tasks.push(self.l1.clone().spawn_cleanup(self.shutdown.child_token()));
        tasks.push(self.stats.clone().spawn_reporter(self.shutdown.child_token()));

        let manager = Arc::clone(self);
        let token = self.shutdown.child_token();
        tasks.push(tokio::spawn(async move { manager.eviction_loop(token).await }));

        if self.config.warmer.enabled {
            let sink: Arc<dyn WarmupSink> = self.clone();
            tasks.push(
                self.warmer
                    .clone()
                    .spawn_queue_drain(sink, self.shutdown.child_token()),
            );

            if self.config.warmer.warm_on_startup {
                let manager = Arc::clone(self);
                let token = self.shutdown.child_token();
                tasks.push(tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        result = manager.warmer.warmup_critical_data(manager.as_ref()) => {
                            info!(
                                category = "cache.manager",
                                "Startup warmup stored {} entries in {} ms",
                                result.total_entries,
                                result.duration_ms
                            );
                        }
                    }
                }));
            }
        }

        info!(category = "cache.manager", "Started {} background tasks", tasks.len());
    }

    #[instrument(skip_all, name = "scheduled_eviction")]
    async fn eviction_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.eviction.interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self
                        .evict_by_policy(self.config.eviction.policy, &EvictOptions::default())
                        .await;
                    debug!(category = "cache.evict", "Scheduled eviction removed {} entries", evicted);
                }
            }
        }
        debug!(category = "cache.evict", "Scheduled eviction stopped");
    }

    /// Stop the background tasks and persist the L2 index
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(category = "cache.manager", "Background task ended abnormally: {}", e);
            }
        }
        self.l2.shutdown().await?;
        info!(category = "cache.manager", "Cache shut down");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn resolve_key(key: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(namespace) => full_key(namespace, key),
            None => key.to_string(),
        }
    }

    fn fail(&self, operation: &str, key: &str, error: &Error) {
        self.stats.record_error(operation, key, error);
        warn!(category = "cache.manager", "{} of '{}' failed: {}", operation, key, error);
    }

    /// TTL for the L1 copy: never longer than L1's own default
    fn l1_ttl(&self, requested: Option<Duration>) -> Duration {
        let cap = self.config.l1.default_ttl();
        requested.map_or(cap, |ttl| ttl.min(cap))
    }

    /// Copy an L2 hit into L1 if the admission rule allows it
    fn promote(&self, key: &str, stored: &Value) {
        let size = match serialized_size(stored) {
            Ok(size) => size,
            Err(e) => {
                self.fail("promote", key, &e);
                return;
            }
        };
        let l2_meta = self.l2.metadata(key);
        let priority = peek_metadata(stored)
            .map(|m| m.priority)
            .or_else(|| l2_meta.as_ref().map(|m| m.priority))
            .unwrap_or(DEFAULT_PRIORITY);

        if !self.config.promotion.should_admit(size, priority) {
            debug!(category = "cache.manager", "Not promoting {} ({} bytes)", key, size);
            return;
        }

        let remaining = l2_meta.and_then(|m| m.remaining_ttl(now_ms()));
        if remaining == Some(Duration::ZERO) {
            return;
        }
        if self
            .l1
            .set_with_priority(key, stored.clone(), Some(self.l1_ttl(remaining)), priority)
        {
            debug!(category = "cache.manager", "Promoted {} to L1", key);
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Look a key up, L1 strictly before L2
    pub async fn get(&self, key: &str, options: &GetOptions) -> Option<Value> {
        self.get_entry(key, options).await.map(|(value, _)| value)
    }

    /// [`get`](Self::get) plus the value's metadata, with this read counted
    ///
    /// An L1 hit updates the stored copy in place. An L2 hit is counted on
    /// the copy promoted into L1; the file itself is not rewritten.
    pub async fn get_entry(&self, key: &str, options: &GetOptions) -> Option<(Value, Option<ValueMetadata>)> {
        let started = Instant::now();
        let key = Self::resolve_key(key, options.namespace.as_deref());

        if !options.skip_l1 {
            if let Some(stored) = self.l1.get_with(&key, record_value_access) {
                self.stats.record_hit(Tier::L1, &key, started.elapsed());
                return Some(unwrap_stored(stored));
            }
        }

        if !options.skip_l2 {
            if let Some(mut stored) = self.l2.get(&key, options.allow_stale).await {
                record_value_access(&mut stored);
                if !options.skip_l1 {
                    self.promote(&key, &stored);
                }
                self.stats.record_hit(Tier::L2, &key, started.elapsed());
                return Some(unwrap_stored(stored));
            }
        }

        self.stats.record_miss(&key, started.elapsed());
        None
    }

    /// Typed [`get`](Self::get); a value of another shape counts as an error
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str, options: &GetOptions) -> Option<T> {
        let value = self.get(key, options).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                self.fail("get", key, &e.into());
                None
            }
        }
    }

    /// Live in either tier? (L1 first)
    pub async fn exists(&self, key: &str, namespace: Option<&str>) -> bool {
        let key = Self::resolve_key(key, namespace);
        self.l1.exists(&key) || self.l2.exists(&key)
    }

    /// Batch get: L1 for all keys, L2 only for the L1 misses
    ///
    /// The result is keyed by the keys as given.
    pub async fn get_multiple(&self, keys: &[String], options: &GetOptions) -> HashMap<String, Value> {
        let started = Instant::now();
        let mut found = HashMap::with_capacity(keys.len());
        let mut pending: Vec<(String, &String)> = Vec::new();

        for raw in keys {
            let key = Self::resolve_key(raw, options.namespace.as_deref());
            let hit = if options.skip_l1 {
                None
            } else {
                self.l1.get_with(&key, record_value_access)
            };
            match hit {
                Some(stored) => {
                    self.stats.record_hit(Tier::L1, &key, started.elapsed());
                    found.insert(raw.clone(), unwrap_stored(stored).0);
                }
                None => pending.push((key, raw)),
            }
        }

        if options.skip_l2 {
            for (key, _) in &pending {
                self.stats.record_miss(key, started.elapsed());
            }
            return found;
        }

        let lookup: Vec<String> = pending.iter().map(|(key, _)| key.clone()).collect();
        let mut l2_hits = self.l2.get_multiple(&lookup, options.allow_stale).await;
        for (key, raw) in pending {
            match l2_hits.remove(&key) {
                Some(mut stored) => {
                    record_value_access(&mut stored);
                    if !options.skip_l1 {
                        self.promote(&key, &stored);
                    }
                    self.stats.record_hit(Tier::L2, &key, started.elapsed());
                    found.insert(raw.clone(), unwrap_stored(stored).0);
                }
                None => self.stats.record_miss(&key, started.elapsed()),
            }
        }
        found
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a value: L2 first, then the L1 mirror
    ///
    /// Succeeds when at least one tier accepted the value. A `None` TTL
    /// takes the namespace default, then the tier defaults.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>, options: &SetOptions) -> bool {
        let started = Instant::now();
        let key = Self::resolve_key(key, options.namespace.as_deref());
        let namespace = options
            .namespace
            .clone()
            .or_else(|| namespace_of(&key).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let settings = self.config.namespace(&namespace);
        let ttl = ttl.or_else(|| settings.default_ttl());
        let priority = clamp_priority(options.priority.unwrap_or(settings.priority));

        let stored = match serialized_size(&value).and_then(|size_bytes| {
            let created_at = now_ms();
            let metadata = ValueMetadata {
                priority,
                created_at,
                ttl_ms: ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
                size_bytes,
                namespace,
                access_count: 0,
                last_accessed: created_at,
            };
            wrap(value, &metadata)
        }) {
            Ok(stored) => stored,
            Err(e) => {
                self.fail("set", &key, &e);
                return false;
            }
        };
        let size = match serialized_size(&stored) {
            Ok(size) => size,
            Err(e) => {
                self.fail("set", &key, &e);
                return false;
            }
        };

        let mut l2_ok = false;
        if !options.skip_l2 {
            let compress = options
                .compression
                .unwrap_or(self.config.l2.compression.enabled);
            match self.l2.set(&key, &stored, ttl, priority, compress).await {
                Ok(true) => l2_ok = true,
                Ok(false) => debug!(category = "cache.manager", "L2 declined {}", key),
                Err(e) => self.fail("set", &key, &e),
            }
        }

        let mut l1_ok = false;
        if !options.skip_l1 && self.config.promotion.should_admit(size, priority) {
            l1_ok = self
                .l1
                .set_with_priority(&key, stored, Some(self.l1_ttl(ttl)), priority);
        }
        if !l1_ok {
            // an older copy must not shadow the new value
            self.l1.delete(&key);
        }

        let success = l2_ok || l1_ok;
        if success {
            self.stats.record_set(&key, size, started.elapsed());
        } else if !options.skip_l2 && size > self.l2.max_bytes() {
            let error = Error::EntryTooLarge {
                tier: Tier::L2.to_string(),
                size,
                max: self.l2.max_bytes(),
            };
            self.fail("set", &key, &error);
        }
        success
    }

    /// Typed [`set`](Self::set)
    pub async fn set_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        options: &SetOptions,
    ) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, value, ttl, options).await,
            Err(e) => {
                self.fail("set", key, &e.into());
                false
            }
        }
    }

    /// Batch set, at most `l2.batch_concurrency` writes in flight
    pub async fn set_multiple(
        &self,
        entries: Vec<(String, Value, Option<Duration>)>,
        options: &SetOptions,
    ) -> usize {
        let concurrency = self.config.l2.batch_concurrency.max(1);
        stream::iter(entries)
            .map(|(key, value, ttl)| async move { self.set(&key, value, ttl, options).await })
            .buffer_unordered(concurrency)
            .filter(|stored| futures::future::ready(*stored))
            .count()
            .await
    }

    /// Remove a key from both tiers
    pub async fn delete(&self, key: &str, namespace: Option<&str>) -> bool {
        let key = Self::resolve_key(key, namespace);
        let in_l1 = self.l1.delete(&key);
        let in_l2 = match self.l2.delete(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.fail("delete", &key, &e);
                false
            }
        };
        let removed = in_l1 || in_l2;
        if removed {
            self.stats.record_delete(&key);
        }
        removed
    }

    /// Remove every matching key from both tiers, returning how many tier
    /// entries were dropped
    pub async fn clear(&self, options: &ClearOptions) -> usize {
        let scope = options.namespace.as_deref().unwrap_or("*");
        let filter = match KeyFilter::new(options.pattern.as_deref(), options.namespace.as_deref()) {
            Ok(filter) => filter,
            Err(e) => {
                self.fail("clear", scope, &e);
                return 0;
            }
        };

        let from_l1 = self.l1.clear(&filter);
        let from_l2 = match self.l2.clear(&filter).await {
            Ok(count) => count,
            Err(e) => {
                self.fail("clear", scope, &e);
                0
            }
        };

        self.stats
            .record_clear(options.namespace.as_deref(), options.pattern.as_deref());
        info!(
            category = "cache.manager",
            "Cleared {} L1 and {} L2 entries (namespace {:?}, pattern {:?})",
            from_l1,
            from_l2,
            options.namespace,
            options.pattern
        );
        from_l1 + from_l2
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Apply an eviction strategy to both tiers, returning the total evicted
    pub async fn evict_by_policy(&self, strategy: EvictionStrategy, options: &EvictOptions) -> usize {
        self.evict_by_policy_detailed(strategy, options).await.total()
    }

    /// Like [`evict_by_policy`](Self::evict_by_policy), with both tiers' reports
    ///
    /// The adaptive strategy resolves against the global hit ratio.
    pub async fn evict_by_policy_detailed(
        &self,
        strategy: EvictionStrategy,
        options: &EvictOptions,
    ) -> EvictionOutcome {
        let percentage = options.percentage.unwrap_or(self.config.eviction.percentage);
        let mut request = EvictionRequest::new(strategy, percentage).with_hit_ratio(self.stats.hit_ratio());
        if let Some(namespace) = &options.namespace {
            request = request.in_namespace(namespace.clone());
        }

        let l1 = self.policy.apply(self.l1.as_ref(), &request).await;
        let l2 = self.policy.apply(self.l2.as_ref(), &request).await;
        let outcome = EvictionOutcome { l1, l2 };

        self.stats
            .record_eviction(strategy.name(), outcome.total() as u64);
        info!(
            category = "cache.evict",
            "{} eviction: L1 {} ({} at {:.1}%), L2 {} ({} at {:.1}%)",
            strategy,
            outcome.l1.evicted,
            outcome.l1.applied,
            outcome.l1.percentage,
            outcome.l2.evicted,
            outcome.l2.applied,
            outcome.l2.percentage
        );
        outcome
    }

    /// Drop expired entries from both tiers
    pub async fn cleanup_expired(&self) -> usize {
        let from_l1 = self.l1.cleanup_expired();
        let from_l2 = match self.l2.cleanup_expired().await {
            Ok(count) => count,
            Err(e) => {
                self.fail("cleanup", "*", &e);
                0
            }
        };
        from_l1 + from_l2
    }

    /// Reconcile the L2 index with its directory
    pub async fn repair_index(&self) -> Result<RepairReport> {
        self.l2.repair_index().await
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    /// Global metrics, per-tier stats, warmer stats and a health score
    pub fn get_stats(&self) -> CacheReport {
        let global = self.stats.snapshot();
        let l1 = self.l1.stats();
        let l2 = self.l2.stats();
        let health_score = health_score(&self.config, &global, &[&l1, &l2]);
        CacheReport {
            global,
            l1,
            l2,
            warmer: self.warmer.stats(),
            health_score,
        }
    }

    /// Aggregate the tier checks into one status
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let uptime = Duration::from_secs_f64(self.stats.snapshot().uptime_secs.max(0.0));

        if let Err(e) = tokio::fs::metadata(&self.config.l2.base_dir).await {
            let error: Error = e.into();
            self.stats.record_error("health", "*", &error);
            return HealthReport::error(format!("L2 directory unavailable: {}", error), uptime);
        }

        let report = self.get_stats();
        let mut checks = Vec::with_capacity(4);
        for tier in [&report.l1, &report.l2] {
            let name = tier.tier.label().to_lowercase();
            checks.push(HealthCheckResult::check(
                format!("{}_usage", name),
                tier.usage < TIER_USAGE_LIMIT,
                format!("{} usage at {:.0}%", tier.tier, tier.usage * 100.0),
            ));
            checks.push(HealthCheckResult::check(
                format!("{}_hit_ratio", name),
                tier.lookups() < TIER_MIN_LOOKUPS
                    || tier.hit_ratio >= TIER_MIN_HIT_RATIO,
                format!("{} hit ratio at {:.2}", tier.tier, tier.hit_ratio),
            ));
        }
        let elapsed = started.elapsed();
        let checks = checks.into_iter().map(|c| c.with_duration(elapsed)).collect();
        HealthReport::from_checks(checks, report.health_score, uptime)
    }

    /// Scoped view that prefixes every key with `name:`
    pub fn get_namespace(self: &Arc<Self>, name: impl Into<String>) -> NamespacedCache {
        NamespacedCache::new(Arc::clone(self), name.into())
    }
}

#[async_trait]
impl WarmupSink for CacheManager {
    async fn warm(&self, entry: WarmEntry) -> bool {
        let options = SetOptions {
            priority: Some(entry.priority),
            ..Default::default()
        };
        self.set(&entry.key, entry.value, entry.ttl, &options).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.l2.base_dir = dir.path().to_path_buf();
        config.l2.index_flush_delay_ms = 50;
        config.warmer.warm_on_startup = false;
        config
    }

    async fn open(dir: &TempDir) -> CacheManager {
        let manager = CacheManager::new(config(dir)).unwrap();
        manager.init().await.unwrap();
        manager
    }

    #[test]
    fn test_wrap_roundtrip() {
        let metadata = ValueMetadata {
            priority: 7,
            created_at: 1,
            ttl_ms: Some(1000),
            size_bytes: 4,
            namespace: "profiles".to_string(),
            access_count: 0,
            last_accessed: 1,
        };
        let stored = wrap(json!({"lang": "en"}), &metadata).unwrap();
        assert_eq!(peek_metadata(&stored), Some(metadata.clone()));

        let (value, meta) = unwrap_stored(stored);
        assert_eq!(value, json!({"lang": "en"}));
        assert_eq!(meta, Some(metadata));
    }

    #[test]
    fn test_unwrap_bare_value() {
        let bare = json!({"value": 1, "other": 2});
        let (value, meta) = unwrap_stored(bare.clone());
        assert_eq!(value, bare);
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn test_set_get() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        assert!(manager.set("scraping:a", json!([1, 2, 3]), None, &SetOptions::default()).await);
        assert_eq!(manager.get("scraping:a", &GetOptions::default()).await, Some(json!([1, 2, 3])));
        assert!(manager.l1().exists("scraping:a"));
        assert!(manager.l2().exists("scraping:a"));
    }

    #[tokio::test]
    async fn test_namespace_option() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let set = SetOptions::in_namespace("users");
        assert!(manager.set("42", json!("prefs"), None, &set).await);
        assert!(manager.exists("users:42", None).await);
        assert_eq!(
            manager.get("42", &GetOptions::in_namespace("users")).await,
            Some(json!("prefs"))
        );

        // namespace defaults: users -> priority 6, 12h TTL
        let meta = manager.l2().metadata("users:42").unwrap();
        assert_eq!(meta.priority, 6);
        assert!(meta.ttl_absolute.is_some());
    }

    #[tokio::test]
    async fn test_l1_ttl_is_capped() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.l1.default_ttl_ms = 1000;
        let manager = CacheManager::new(cfg).unwrap();
        manager.init().await.unwrap();

        let day = Duration::from_secs(86_400);
        assert!(manager.set("k", json!(1), Some(day), &SetOptions::default()).await);

        let now = now_ms();
        let l1_expiry = manager.l1().metadata("k").unwrap().ttl_absolute.unwrap();
        let l2_expiry = manager.l2().metadata("k").unwrap().ttl_absolute.unwrap();
        assert!(l1_expiry <= now + 1000);
        assert!(l2_expiry > now + 3_600_000);
    }

    #[tokio::test]
    async fn test_oversized_value_skips_l1() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let big = json!("x".repeat(150_000));
        assert!(manager.set("big", big.clone(), None, &SetOptions::default()).await);
        assert!(!manager.l1().exists("big"));
        assert_eq!(manager.get("big", &GetOptions::default()).await, Some(big));
        // the L2 hit is too large to promote
        assert!(!manager.l1().exists("big"));
    }

    #[tokio::test]
    async fn test_high_priority_forces_l1() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let big = json!("x".repeat(150_000));
        let options = SetOptions::default().with_priority(9);
        assert!(manager.set("big", big, None, &options).await);
        assert!(manager.l1().exists("big"));
    }

    #[tokio::test]
    async fn test_skip_l2_still_succeeds() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let options = SetOptions {
            skip_l2: true,
            ..Default::default()
        };
        assert!(manager.set("memory-only", json!(true), None, &options).await);
        assert!(!manager.l2().exists("memory-only"));
        assert!(manager.l1().exists("memory-only"));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        for key in ["temp:a", "temp:b", "scraping:c"] {
            manager.set(key, json!(key), None, &SetOptions::default()).await;
        }

        assert!(manager.delete("a", Some("temp")).await);
        assert!(!manager.delete("a", Some("temp")).await);

        let cleared = manager
            .clear(&ClearOptions {
                namespace: Some("temp".to_string()),
                pattern: None,
            })
            .await;
        assert_eq!(cleared, 2); // temp:b from both tiers
        assert!(manager.exists("scraping:c", None).await);
    }

    #[tokio::test]
    async fn test_clear_by_pattern() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;
        manager.set("k", json!(1), None, &SetOptions::default()).await;

        let cleared = manager
            .clear(&ClearOptions {
                namespace: None,
                pattern: Some("k*".to_string()),
            })
            .await;
        assert_eq!(cleared, 2);
        assert_eq!(manager.stats().snapshot().clears, 1);
    }

    #[tokio::test]
    async fn test_get_multiple_promotes_l2_hits() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        manager.set("ns:a", json!(1), None, &SetOptions::default()).await;
        let l2_only = SetOptions {
            skip_l1: true,
            ..Default::default()
        };
        manager.set("ns:b", json!(2), None, &l2_only).await;

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = manager.get_multiple(&keys, &GetOptions::in_namespace("ns")).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], json!(2));
        assert!(manager.l1().exists("ns:b"));

        let snapshot = manager.stats().snapshot();
        assert_eq!(snapshot.hits_for(Tier::L1), 1);
        assert_eq!(snapshot.hits_for(Tier::L2), 1);
        assert_eq!(snapshot.misses, 1);
    }

    #[tokio::test]
    async fn test_set_multiple() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let entries = (0..25)
            .map(|i| (format!("batch:{}", i), json!(i), None))
            .collect();
        assert_eq!(manager.set_multiple(entries, &SetOptions::default()).await, 25);
        assert_eq!(manager.l2().len(), 25);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            lang: String,
            pages: u32,
        }

        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;
        let profile = Profile {
            lang: "en".to_string(),
            pages: 3,
        };

        assert!(manager.set_value("profiles:x", &profile, None, &SetOptions::default()).await);
        let back: Option<Profile> = manager.get_value("profiles:x", &GetOptions::default()).await;
        assert_eq!(back, Some(profile));

        let wrong: Option<Vec<u8>> = manager.get_value("profiles:x", &GetOptions::default()).await;
        assert!(wrong.is_none());
        assert_eq!(manager.stats().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_evict_by_policy_records_stats() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        for i in 0..10 {
            manager.set(&format!("e:{}", i), json!(i), None, &SetOptions::default()).await;
        }
        let options = EvictOptions {
            percentage: Some(50.0),
            namespace: None,
        };
        let outcome = manager.evict_by_policy_detailed(EvictionStrategy::Lru, &options).await;
        assert_eq!(outcome.l1.evicted, 5);
        assert_eq!(outcome.l2.evicted, 5);

        let snapshot = manager.stats().snapshot();
        assert_eq!(snapshot.evictions, 10);
        assert_eq!(snapshot.evictions_by_policy["lru"], 10);
    }

    #[tokio::test]
    async fn test_health_check_fresh_cache() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let report = manager.health_check().await;
        assert!(report.status.is_healthy());
        assert_eq!(report.checks.len(), 4);
        assert_eq!(report.score, 100.0);
    }

    #[tokio::test]
    async fn test_health_check_missing_directory() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;
        manager.shutdown().await.unwrap();
        drop(dir);

        let report = manager.health_check().await;
        assert_eq!(report.status, crate::monitoring::HealthStatus::Error);
    }

    #[test]
    fn test_health_score_penalties() {
        let config = CacheConfig::default();
        let stats = CacheStats::default();
        for _ in 0..10 {
            stats.record_miss("k", Duration::from_millis(1));
        }
        let snapshot = stats.snapshot();
        let tier = crate::cache::TierCounters::new().snapshot(Tier::L1, 1, 95, 100);

        let score = health_score(&config, &snapshot, &[&tier]);
        // hit ratio 0 (-30), usage 0.95 (-15)
        assert_eq!(score, 55.0);
    }

    #[tokio::test]
    async fn test_warm_sink_writes_through() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        let stored = manager
            .warm(WarmEntry {
                key: "profiles:acme.com".to_string(),
                value: json!({"lang": "en"}),
                ttl: Some(Duration::from_secs(60)),
                priority: 7,
            })
            .await;
        assert!(stored);
        assert_eq!(manager.l2().metadata("profiles:acme.com").unwrap().priority, 7);
    }

    #[tokio::test]
    async fn test_recent_source_unwraps() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;
        manager
            .set("profiles:a", json!({"lang": "fr"}), None, &SetOptions::default())
            .await;

        let source = UnwrappedRecent {
            l2: manager.l2().clone(),
        };
        let recent = source
            .recent_entries(Duration::from_secs(3600), 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].value, json!({"lang": "fr"}));
        assert_eq!(recent[0].priority, 7);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(open(&dir).await);
        manager.start();
        manager.start();
        manager.set("k", json!(1), None, &SetOptions::default()).await;
        manager.shutdown().await.unwrap();

        assert_eq!(manager.l2().unpersisted_mutations(), 0);
        assert!(dir.path().join(crate::cache::INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn test_invalid_weights_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.eviction.weights.recency = 0.05;
        assert!(CacheManager::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_start_runs_startup_warmup() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.warmer.warm_on_startup = true;
        let manager = CacheManager::new(cfg).unwrap();
        manager.init().await.unwrap();
        manager.set("scraping:seen", json!(1), None, &SetOptions::default()).await;

        let manager = Arc::new(manager);
        manager.start();
        let mut last_run = None;
        for _ in 0..100 {
            last_run = manager.warmer().stats().last_run;
            if last_run.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.shutdown().await.unwrap();

        let last_run = last_run.expect("startup warmup never finished");
        assert!(last_run.success);
        assert_eq!(last_run.results.len(), 1);
        assert_eq!(last_run.results[0].kind, crate::cache::WarmupKind::RecentFiles);
        assert_eq!(last_run.total_entries, 1);
    }

    #[tokio::test]
    async fn test_overwrite_rejected_by_l1_drops_old_copy() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.l1.max_size_mb = 0.05;
        let manager = CacheManager::new(cfg).unwrap();
        manager.init().await.unwrap();

        manager.set("k", json!("old"), None, &SetOptions::default()).await;
        assert!(manager.l1().exists("k"));

        // admitted by size rule, but larger than the whole L1 budget
        let big = json!("x".repeat(80_000));
        assert!(manager.set("k", big.clone(), None, &SetOptions::default()).await);
        assert!(!manager.l1().exists("k"));
        assert_eq!(manager.get("k", &GetOptions::default()).await, Some(big));
    }

    #[tokio::test]
    async fn test_l2_only_overwrite_drops_old_l1_copy() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;

        manager.set("k", json!("old"), None, &SetOptions::default()).await;
        let l2_only = SetOptions {
            skip_l1: true,
            ..Default::default()
        };
        assert!(manager.set("k", json!("new"), None, &l2_only).await);
        assert_eq!(manager.get("k", &GetOptions::default()).await, Some(json!("new")));
    }

    #[tokio::test]
    async fn test_reads_are_counted_in_metadata() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir).await;
        let options = GetOptions::default();

        manager.set("profiles:a", json!({"lang": "en"}), None, &SetOptions::default()).await;
        let (_, first) = manager.get_entry("profiles:a", &options).await.unwrap();
        let (value, second) = manager.get_entry("profiles:a", &options).await.unwrap();
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(value, json!({"lang": "en"}));
        assert_eq!(first.access_count, 1);
        assert_eq!(second.access_count, 2);
        assert!(second.last_accessed >= second.created_at);

        // L2 hit counts on the promoted copy
        let l2_only = SetOptions {
            skip_l1: true,
            ..Default::default()
        };
        manager.set("profiles:b", json!(2), None, &l2_only).await;
        let (_, from_l2) = manager.get_entry("profiles:b", &options).await.unwrap();
        assert_eq!(from_l2.unwrap().access_count, 1);
        let (_, from_l1) = manager.get_entry("profiles:b", &options).await.unwrap();
        assert_eq!(from_l1.unwrap().access_count, 2);
        assert_eq!(manager.stats().snapshot().hits_for(Tier::L2), 1);
    }
}
