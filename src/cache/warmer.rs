//! Cache Warmer
//!
//! Populates the cache before real traffic pays the cold-start latency.
//!
//! Strategies are registered once, at construction, in a registry keyed by
//! [`WarmupKind`]. Each strategy reads its external source, filters for
//! entries worth preloading and writes them through a [`WarmupSink`] (the
//! manager's normal `set` path). The warmer never touches a tier directly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::entry::{duration_ms, full_key, now_ms};
use crate::error::{Error, Result};

// =============================================================================
// Kinds and Configuration
// =============================================================================

/// Built-in warmup strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupKind {
    DomainProfiles,
    UserPreferences,
    PopularSearches,
    RecentFiles,
}

impl WarmupKind {
    pub fn all() -> [WarmupKind; 4] {
        [
            WarmupKind::DomainProfiles,
            WarmupKind::UserPreferences,
            WarmupKind::PopularSearches,
            WarmupKind::RecentFiles,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            WarmupKind::DomainProfiles => "domain_profiles",
            WarmupKind::UserPreferences => "user_preferences",
            WarmupKind::PopularSearches => "popular_searches",
            WarmupKind::RecentFiles => "recent_files",
        }
    }
}

impl std::fmt::Display for WarmupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-strategy knobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub enabled: bool,
    pub max_items: usize,
}

/// Settings of every built-in strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerStrategies {
    pub domain_profiles: StrategySettings,
    pub user_preferences: StrategySettings,
    pub popular_searches: StrategySettings,
    pub recent_files: StrategySettings,
}

impl Default for WarmerStrategies {
    fn default() -> Self {
        let on = |max_items| StrategySettings {
            enabled: true,
            max_items,
        };
        Self {
            domain_profiles: on(100),
            user_preferences: on(50),
            popular_searches: on(50),
            recent_files: on(200),
        }
    }
}

impl WarmerStrategies {
    pub fn get(&self, kind: WarmupKind) -> StrategySettings {
        match kind {
            WarmupKind::DomainProfiles => self.domain_profiles,
            WarmupKind::UserPreferences => self.user_preferences,
            WarmupKind::PopularSearches => self.popular_searches,
            WarmupKind::RecentFiles => self.recent_files,
        }
    }
}

/// Warmer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub enabled: bool,
    /// Run a full warmup when the manager starts
    pub warm_on_startup: bool,
    /// Strategies running at the same time
    pub max_concurrency: usize,
    /// Bound on each upstream query
    pub source_timeout_ms: u64,
    /// Minimum historical hits for profiles and searches
    pub min_hit_count: u64,
    /// Users active within this window get their preferences preloaded
    pub user_recency_hours: u64,
    /// Cache files accessed within this window are replayed
    pub recent_files_hours: u64,
    /// Runs kept per strategy
    pub history_size: usize,
    pub strategies: WarmerStrategies,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warm_on_startup: true,
            max_concurrency: 3,
            source_timeout_ms: 30_000,
            min_hit_count: 3,
            user_recency_hours: 7 * 24,
            recent_files_hours: 24,
            history_size: 10,
            strategies: WarmerStrategies::default(),
        }
    }
}

impl WarmerConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

// =============================================================================
// Sinks and Sources
// =============================================================================

/// One entry to preload; `key` is the full `namespace:key`
#[derive(Debug, Clone, PartialEq)]
pub struct WarmEntry {
    pub key: String,
    pub value: Value,
    pub ttl: Option<Duration>,
    pub priority: u8,
}

/// Write path used by the warmer
#[async_trait]
pub trait WarmupSink: Send + Sync {
    /// Store one entry, returning whether it was accepted
    async fn warm(&self, entry: WarmEntry) -> bool;
}

/// Frequently requested domain profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub domain: String,
    pub profile: Value,
    pub hit_count: u64,
}

/// Recently active user's preferences
#[derive(Debug, Clone, PartialEq)]
pub struct UserPreferenceRecord {
    pub user_id: String,
    pub preferences: Value,
    /// Last activity (epoch ms)
    pub last_active: i64,
}

/// Past search with its results
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRecord {
    pub query: String,
    pub results: Value,
    pub hit_count: u64,
}

/// Entry read back from the file tier
#[derive(Debug, Clone, PartialEq)]
pub struct RecentEntry {
    pub key: String,
    pub value: Value,
    pub priority: u8,
    pub last_accessed: i64,
    pub remaining_ttl: Option<Duration>,
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn popular_profiles(&self, limit: usize) -> Result<Vec<ProfileRecord>>;
}

#[async_trait]
pub trait UserPreferenceSource: Send + Sync {
    async fn active_users(&self, limit: usize) -> Result<Vec<UserPreferenceRecord>>;
}

#[async_trait]
pub trait SearchHistorySource: Send + Sync {
    async fn popular_searches(&self, limit: usize) -> Result<Vec<SearchRecord>>;
}

#[async_trait]
pub trait RecentEntrySource: Send + Sync {
    async fn recent_entries(&self, within: Duration, limit: usize) -> Result<Vec<RecentEntry>>;
}

/// External collaborators feeding the built-in strategies
#[derive(Clone, Default)]
pub struct WarmupSources {
    pub profiles: Option<Arc<dyn ProfileSource>>,
    pub users: Option<Arc<dyn UserPreferenceSource>>,
    pub searches: Option<Arc<dyn SearchHistorySource>>,
    pub recent: Option<Arc<dyn RecentEntrySource>>,
}

async fn query_source<T>(
    name: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::SourceTimeout {
            source_name: name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn write_all(sink: &dyn WarmupSink, entries: Vec<WarmEntry>) -> usize {
    let mut stored = 0;
    for entry in entries {
        if sink.warm(entry).await {
            stored += 1;
        }
    }
    stored
}

// =============================================================================
// Strategies
// =============================================================================

/// A warmup strategy
#[async_trait]
pub trait WarmupStrategy: Send + Sync {
    fn kind(&self) -> WarmupKind;

    /// Lower runs first
    fn priority(&self) -> u8;

    /// Load and store entries, returning how many were stored
    async fn warm(&self, sink: &dyn WarmupSink) -> Result<usize>;
}

/// Preload profiles of frequently requested domains
pub struct DomainProfileWarmup {
    source: Arc<dyn ProfileSource>,
    settings: StrategySettings,
    min_hit_count: u64,
    timeout: Duration,
}

#[async_trait]
impl WarmupStrategy for DomainProfileWarmup {
    fn kind(&self) -> WarmupKind {
        WarmupKind::DomainProfiles
    }

    fn priority(&self) -> u8 {
        1
    }

    async fn warm(&self, sink: &dyn WarmupSink) -> Result<usize> {
        let mut profiles = query_source(
            "profiles",
            self.timeout,
            self.source.popular_profiles(self.settings.max_items),
        )
        .await?;
        profiles.retain(|p| p.hit_count >= self.min_hit_count);
        profiles.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        profiles.truncate(self.settings.max_items);

        let entries = profiles
            .into_iter()
            .map(|p| WarmEntry {
                key: full_key("profiles", &p.domain),
                value: p.profile,
                ttl: Some(Duration::from_secs(24 * 3600)),
                priority: 7,
            })
            .collect();
        Ok(write_all(sink, entries).await)
    }
}

/// Preload preferences of recently active users
pub struct UserPreferenceWarmup {
    source: Arc<dyn UserPreferenceSource>,
    settings: StrategySettings,
    recency: Duration,
    timeout: Duration,
}

#[async_trait]
impl WarmupStrategy for UserPreferenceWarmup {
    fn kind(&self) -> WarmupKind {
        WarmupKind::UserPreferences
    }

    fn priority(&self) -> u8 {
        2
    }

    async fn warm(&self, sink: &dyn WarmupSink) -> Result<usize> {
        let users = query_source(
            "users",
            self.timeout,
            self.source.active_users(self.settings.max_items),
        )
        .await?;
        let cutoff = now_ms().saturating_sub(duration_ms(self.recency));

        let entries = users
            .into_iter()
            .filter(|u| u.last_active >= cutoff)
            .take(self.settings.max_items)
            .map(|u| WarmEntry {
                key: full_key("users", &format!("{}:preferences", u.user_id)),
                value: u.preferences,
                ttl: Some(Duration::from_secs(12 * 3600)),
                priority: 6,
            })
            .collect();
        Ok(write_all(sink, entries).await)
    }
}

/// Preload results of popular searches
pub struct PopularSearchWarmup {
    source: Arc<dyn SearchHistorySource>,
    settings: StrategySettings,
    min_hit_count: u64,
    timeout: Duration,
}

#[async_trait]
impl WarmupStrategy for PopularSearchWarmup {
    fn kind(&self) -> WarmupKind {
        WarmupKind::PopularSearches
    }

    fn priority(&self) -> u8 {
        3
    }

    async fn warm(&self, sink: &dyn WarmupSink) -> Result<usize> {
        let mut searches = query_source(
            "searches",
            self.timeout,
            self.source.popular_searches(self.settings.max_items),
        )
        .await?;
        searches.retain(|s| s.hit_count >= self.min_hit_count);
        searches.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        searches.truncate(self.settings.max_items);

        let entries = searches
            .into_iter()
            .map(|s| WarmEntry {
                key: full_key("scraping", &format!("search:{}", s.query)),
                value: s.results,
                ttl: Some(Duration::from_secs(3600)),
                priority: 5,
            })
            .collect();
        Ok(write_all(sink, entries).await)
    }
}

/// Replay recently accessed file-tier entries
pub struct RecentFilesWarmup {
    source: Arc<dyn RecentEntrySource>,
    settings: StrategySettings,
    within: Duration,
    timeout: Duration,
}

#[async_trait]
impl WarmupStrategy for RecentFilesWarmup {
    fn kind(&self) -> WarmupKind {
        WarmupKind::RecentFiles
    }

    fn priority(&self) -> u8 {
        4
    }

    async fn warm(&self, sink: &dyn WarmupSink) -> Result<usize> {
        let recent = query_source(
            "recent_files",
            self.timeout,
            self.source.recent_entries(self.within, self.settings.max_items),
        )
        .await?;

        let entries = recent
            .into_iter()
            .map(|r| WarmEntry {
                key: r.key,
                value: r.value,
                ttl: r.remaining_ttl,
                priority: r.priority,
            })
            .collect();
        Ok(write_all(sink, entries).await)
    }
}

// =============================================================================
// Results and History
// =============================================================================

/// Outcome of one strategy run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub kind: WarmupKind,
    pub count: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a full warmup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupResult {
    pub success: bool,
    /// Another run was already in progress
    pub skipped: bool,
    pub total_entries: usize,
    pub duration_ms: u64,
    pub results: Vec<StrategyResult>,
}

/// Rolling figures for one strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub runs: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_entries: f64,
    pub last_error: Option<String>,
}

/// Snapshot returned by [`CacheWarmer::stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmerStats {
    pub is_warming: bool,
    pub registered: Vec<WarmupKind>,
    pub scheduled: usize,
    pub strategies: BTreeMap<WarmupKind, StrategyStats>,
    pub last_run: Option<WarmupResult>,
}

/// Strategy run deferred to a later time
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledWarmup {
    pub id: Uuid,
    pub kind: WarmupKind,
    pub due: Instant,
}

struct WarmingGuard<'a>(&'a AtomicBool);

impl Drop for WarmingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Cache Warmer
// =============================================================================

/// Orchestrates warmup strategies
pub struct CacheWarmer {
    config: WarmerConfig,
    registry: BTreeMap<WarmupKind, Arc<dyn WarmupStrategy>>,
    warming: AtomicBool,
    history: Mutex<HashMap<WarmupKind, VecDeque<StrategyResult>>>,
    queue: Mutex<Vec<ScheduledWarmup>>,
    queue_changed: Notify,
    last_run: Mutex<Option<WarmupResult>>,
}

impl std::fmt::Debug for CacheWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWarmer")
            .field("registered", &self.registry.keys().collect::<Vec<_>>())
            .field("warming", &self.warming.load(Ordering::Relaxed))
            .finish()
    }
}

impl CacheWarmer {
    /// Build the registry from whichever sources are available and enabled
    pub fn new(config: WarmerConfig, sources: WarmupSources) -> Self {
        let timeout = config.source_timeout();
        let settings = config.strategies;
        let mut strategies: Vec<Arc<dyn WarmupStrategy>> = Vec::new();

        if let Some(source) = sources.profiles {
            strategies.push(Arc::new(DomainProfileWarmup {
                source,
                settings: settings.domain_profiles,
                min_hit_count: config.min_hit_count,
                timeout,
            }));
        }
        if let Some(source) = sources.users {
            strategies.push(Arc::new(UserPreferenceWarmup {
                source,
                settings: settings.user_preferences,
                recency: Duration::from_secs(config.user_recency_hours * 3600),
                timeout,
            }));
        }
        if let Some(source) = sources.searches {
            strategies.push(Arc::new(PopularSearchWarmup {
                source,
                settings: settings.popular_searches,
                min_hit_count: config.min_hit_count,
                timeout,
            }));
        }
        if let Some(source) = sources.recent {
            strategies.push(Arc::new(RecentFilesWarmup {
                source,
                settings: settings.recent_files,
                within: Duration::from_secs(config.recent_files_hours * 3600),
                timeout,
            }));
        }

        Self::with_strategies(config, strategies)
    }

    /// Build from explicit strategies; disabled kinds are skipped
    pub fn with_strategies(config: WarmerConfig, strategies: Vec<Arc<dyn WarmupStrategy>>) -> Self {
        let registry = strategies
            .into_iter()
            .filter(|s| config.strategies.get(s.kind()).enabled)
            .map(|s| (s.kind(), s))
            .collect();
        Self {
            config,
            registry,
            warming: AtomicBool::new(false),
            history: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            queue_changed: Notify::new(),
            last_run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    pub fn registered(&self) -> Vec<WarmupKind> {
        self.registry.keys().copied().collect()
    }

    pub fn is_warming(&self) -> bool {
        self.warming.load(Ordering::Acquire)
    }

    /// Run every registered strategy in priority order, at most
    /// `max_concurrency` at a time
    ///
    /// A failing strategy is reported with `count: 0` and its error; it does
    /// not stop the others. A call made while another run is in progress
    /// returns immediately with `skipped: true`.
    pub async fn warmup_critical_data(&self, sink: &dyn WarmupSink) -> WarmupResult {
        if self
            .warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(category = "cache.warmer", "Warmup already running, skipping");
            return WarmupResult {
                success: false,
                skipped: true,
                total_entries: 0,
                duration_ms: 0,
                results: Vec::new(),
            };
        }
        let _guard = WarmingGuard(&self.warming);

        let start = Instant::now();
        let mut ordered: Vec<Arc<dyn WarmupStrategy>> = self.registry.values().cloned().collect();
        ordered.sort_by_key(|s| s.priority());

        info!(
            category = "cache.warmer",
            "Starting warmup with {} strategies", ordered.len()
        );
        let runs: Vec<BoxFuture<'_, StrategyResult>> = ordered
            .iter()
            .map(|strategy| self.run_strategy(strategy.as_ref(), sink).boxed())
            .collect();
        let results: Vec<StrategyResult> = stream::iter(runs)
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let result = WarmupResult {
            success: true,
            skipped: false,
            total_entries: results.iter().map(|r| r.count).sum(),
            duration_ms: start.elapsed().as_millis() as u64,
            results,
        };
        info!(
            category = "cache.warmer",
            "Warmup finished: {} entries in {}ms", result.total_entries, result.duration_ms
        );
        *self.last_run.lock() = Some(result.clone());
        result
    }

    /// Run a single registered strategy
    pub async fn warmup_strategy(&self, kind: WarmupKind, sink: &dyn WarmupSink) -> Option<StrategyResult> {
        let strategy = self.registry.get(&kind)?.clone();
        Some(self.run_strategy(strategy.as_ref(), sink).await)
    }

    async fn run_strategy(&self, strategy: &dyn WarmupStrategy, sink: &dyn WarmupSink) -> StrategyResult {
        let start = Instant::now();
        let kind = strategy.kind();
        let outcome = strategy.warm(sink).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(count) => {
                debug!(category = "cache.warmer", "{} warmed {} entries", kind, count);
                StrategyResult {
                    kind,
                    count,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                warn!(category = "cache.warmer", "{} failed: {}", kind, e);
                StrategyResult {
                    kind,
                    count: 0,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        };

        let mut history = self.history.lock();
        let runs = history.entry(kind).or_default();
        if runs.len() >= self.config.history_size.max(1) {
            runs.pop_front();
        }
        runs.push_back(result.clone());
        result
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Defer a strategy run by `delay`
    pub fn schedule(&self, kind: WarmupKind, delay: Duration) -> Uuid {
        let id = Uuid::new_v4();
        self.queue.lock().push(ScheduledWarmup {
            id,
            kind,
            due: Instant::now() + delay,
        });
        self.queue_changed.notify_one();
        debug!(category = "cache.warmer", "Scheduled {} in {:?} ({})", kind, delay, id);
        id
    }

    /// Drop a scheduled run; false when unknown or already run
    pub fn cancel_scheduled(&self, id: Uuid) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|s| s.id != id);
        queue.len() != before
    }

    pub fn scheduled(&self) -> Vec<ScheduledWarmup> {
        self.queue.lock().clone()
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.lock().iter().map(|s| s.due).min()
    }

    /// Run every scheduled strategy whose time has come
    pub async fn run_due(&self, sink: &dyn WarmupSink) -> Vec<StrategyResult> {
        let now = Instant::now();
        let mut due: Vec<ScheduledWarmup> = {
            let mut queue = self.queue.lock();
            let (ready, pending): (Vec<_>, Vec<_>) = queue.drain(..).partition(|s| s.due <= now);
            *queue = pending;
            ready
        };
        due.sort_by_key(|s| s.due);

        let mut results = Vec::with_capacity(due.len());
        for item in due {
            match self.warmup_strategy(item.kind, sink).await {
                Some(result) => results.push(result),
                None => warn!(
                    category = "cache.warmer",
                    "Scheduled {} is not registered, dropping", item.kind
                ),
            }
        }
        results
    }

    /// Drain the schedule as entries come due, until cancelled
    pub fn spawn_queue_drain(
        self: Arc<Self>,
        sink: Arc<dyn WarmupSink>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.drain_loop(sink, shutdown).await })
    }

    #[instrument(skip_all, name = "warmer_queue")]
    async fn drain_loop(&self, sink: Arc<dyn WarmupSink>, shutdown: CancellationToken) {
        loop {
            let next = self.next_due();
            let wake = async move {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.queue_changed.notified() => continue,
                _ = wake => {
                    self.run_due(sink.as_ref()).await;
                }
            }
        }
        debug!(category = "cache.warmer", "Warmup queue drain stopped");
    }

    /// Rolling history per strategy plus the last full run
    pub fn stats(&self) -> WarmerStats {
        let history = self.history.lock();
        let strategies = history
            .iter()
            .map(|(kind, runs)| {
                let count = runs.len().max(1) as f64;
                let ok = runs.iter().filter(|r| r.error.is_none()).count();
                let stats = StrategyStats {
                    runs: runs.len(),
                    success_rate: ok as f64 / count,
                    avg_duration_ms: runs.iter().map(|r| r.duration_ms as f64).sum::<f64>() / count,
                    avg_entries: runs.iter().map(|r| r.count as f64).sum::<f64>() / count,
                    last_error: runs.iter().rev().find_map(|r| r.error.clone()),
                };
                (*kind, stats)
            })
            .collect();

        WarmerStats {
            is_warming: self.is_warming(),
            registered: self.registered(),
            scheduled: self.queue.lock().len(),
            strategies,
            last_run: self.last_run.lock().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
