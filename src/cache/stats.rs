//! Cache Statistics and Alerting
//!
//! Passive observer of cache traffic. Records hits, misses, writes, deletes,
//! evictions and errors, derives the usual health metrics from them and
//! raises threshold alerts. Never mutates cache state.
//!
//! Per-tier counters ([`TierCounters`]) live with each tier; [`CacheStats`]
//! holds the cross-tier view recorded by the manager.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{namespace_of, DEFAULT_NAMESPACE};
use crate::error::{Error, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Tier is unhealthy above this usage ratio
pub const TIER_USAGE_LIMIT: f64 = 0.90;

/// Tier is unhealthy below this hit ratio (once enough lookups were seen)
pub const TIER_MIN_HIT_RATIO: f64 = 0.50;

/// Lookups needed before the tier hit ratio counts toward health
pub const TIER_MIN_LOOKUPS: u64 = 100;

// =============================================================================
// Tiers
// =============================================================================

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    L1,
    L2,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::L1 => "L1",
            Tier::L2 => "L2",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lock-free per-tier counters
#[derive(Debug, Default)]
pub struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit ratio, `None` before the first lookup
    pub fn hit_ratio(&self) -> Option<f64> {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    /// Combine counters with the tier's capacity view
    pub fn snapshot(&self, tier: Tier, entries: usize, used_bytes: u64, max_bytes: u64) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        TierStats {
            tier,
            entries,
            used_bytes,
            max_bytes,
            used_size_mb: used_bytes as f64 / BYTES_PER_MB,
            max_size_mb: max_bytes as f64 / BYTES_PER_MB,
            usage: if max_bytes == 0 {
                0.0
            } else {
                used_bytes as f64 / max_bytes as f64
            },
            hits,
            misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unpersisted_mutations: None,
        }
    }
}

/// Point-in-time view of one tier
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub tier: Tier,
    pub entries: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub used_size_mb: f64,
    pub max_size_mb: f64,
    /// used / max
    pub usage: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub errors: u64,
    /// Index changes not yet persisted (file tier only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpersisted_mutations: Option<u64>,
}

impl TierStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Usage below 90%, and hit ratio at least 50% once 100 lookups were seen
    pub fn is_healthy(&self) -> bool {
        let usage_ok = self.usage < TIER_USAGE_LIMIT;
        let hit_ok = self.lookups() < TIER_MIN_LOOKUPS || self.hit_ratio >= TIER_MIN_HIT_RATIO;
        usage_ok && hit_ok
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Alert when the global hit ratio drops below this
    pub hit_ratio: f64,
    /// Alert when the average response time exceeds this (ms)
    pub avg_response_ms: f64,
    /// Alert when errors / requests exceeds this
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            hit_ratio: 0.80,
            avg_response_ms: 100.0,
            error_rate: 0.05,
        }
    }
}

/// Stats configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Reservoir size per operation for percentile estimates
    pub sample_size: usize,
    /// Fraction of latency observations kept in the reservoir
    pub sampling_rate: f64,
    /// Alert ring-buffer capacity
    pub max_alerts: usize,
    pub thresholds: AlertThresholds,
    /// Periodic report interval
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_size: 1000,
            sampling_rate: 0.1,
            max_alerts: 100,
            thresholds: AlertThresholds::default(),
            report_interval_secs: 300,
        }
    }
}

impl StatsConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Keep every n-th latency observation
    fn sample_stride(&self) -> u64 {
        if self.sampling_rate <= 0.0 {
            return u64::MAX;
        }
        (1.0 / self.sampling_rate.min(1.0)).round().max(1.0) as u64
    }
}

// =============================================================================
// Alerts
// =============================================================================

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One raised alert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub severity: AlertSeverity,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Latency summary for one operation type
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

/// Per-namespace summary
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub avg_entry_size: f64,
}

/// Serializable view of every global metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    /// Hits per tier
    pub tier_hits: BTreeMap<Tier, u64>,
    /// Share of all hits served by each tier
    pub tier_hit_share: BTreeMap<Tier, f64>,
    pub sets: u64,
    pub deletes: u64,
    pub clears: u64,
    pub evictions: u64,
    pub evictions_by_policy: BTreeMap<String, u64>,
    pub errors: u64,
    pub error_rate: f64,
    pub errors_by_operation: BTreeMap<String, u64>,
    /// Requests per second since the last reset
    pub throughput: f64,
    pub avg_response_ms: f64,
    pub latency: BTreeMap<String, LatencySummary>,
    pub namespaces: BTreeMap<String, NamespaceSummary>,
    pub alert_count: usize,
}

impl StatsSnapshot {
    /// Structured export
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Hits of one tier
    pub fn hits_for(&self, tier: Tier) -> u64 {
        self.tier_hits.get(&tier).copied().unwrap_or(0)
    }
}

// =============================================================================
// Cache Stats
// =============================================================================

#[derive(Debug, Default)]
struct LatencyTrack {
    count: u64,
    total_ms: f64,
    reservoir: VecDeque<f64>,
}

impl LatencyTrack {
    fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            avg_ms: if self.count == 0 {
                0.0
            } else {
                self.total_ms / self.count as f64
            },
            p95_ms: percentile(&self.reservoir, 0.95),
        }
    }
}

#[derive(Debug, Default)]
struct NamespaceTrack {
    hits: u64,
    misses: u64,
    sets: u64,
    total_size: u64,
}

#[derive(Debug)]
struct StatsInner {
    started: Instant,
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    clears: u64,
    evictions: u64,
    errors: u64,
    tier_hits: BTreeMap<Tier, u64>,
    evictions_by_policy: BTreeMap<String, u64>,
    errors_by_operation: BTreeMap<String, u64>,
    latency: HashMap<&'static str, LatencyTrack>,
    namespaces: HashMap<String, NamespaceTrack>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            hits: 0,
            misses: 0,
            sets: 0,
            deletes: 0,
            clears: 0,
            evictions: 0,
            errors: 0,
            tier_hits: BTreeMap::new(),
            evictions_by_policy: BTreeMap::new(),
            errors_by_operation: BTreeMap::new(),
            latency: HashMap::new(),
            namespaces: HashMap::new(),
        }
    }

    fn total_requests(&self) -> u64 {
        self.hits + self.misses + self.sets + self.deletes
    }

    fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            None
        } else {
            Some(self.hits as f64 / lookups as f64)
        }
    }

    fn error_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.errors as f64 / total as f64
        }
    }

    fn avg_response_ms(&self) -> f64 {
        let (count, total) = self
            .latency
            .values()
            .fold((0u64, 0.0f64), |(c, t), track| (c + track.count, t + track.total_ms));
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    fn namespace(&mut self, key: &str) -> &mut NamespaceTrack {
        let namespace = namespace_of(key).unwrap_or(DEFAULT_NAMESPACE);
        self.namespaces.entry(namespace.to_string()).or_default()
    }

    fn snapshot(&self, alert_count: usize) -> StatsSnapshot {
        let total_hits: u64 = self.tier_hits.values().sum();
        let tier_hit_share = self
            .tier_hits
            .iter()
            .map(|(tier, hits)| {
                let share = if total_hits == 0 {
                    0.0
                } else {
                    *hits as f64 / total_hits as f64
                };
                (*tier, share)
            })
            .collect();

        let uptime = self.started.elapsed().as_secs_f64();
        let total_requests = self.total_requests();

        StatsSnapshot {
            timestamp: Utc::now(),
            uptime_secs: uptime,
            total_requests,
            hits: self.hits,
            misses: self.misses,
            hit_ratio: self.hit_ratio().unwrap_or(0.0),
            tier_hits: self.tier_hits.clone(),
            tier_hit_share,
            sets: self.sets,
            deletes: self.deletes,
            clears: self.clears,
            evictions: self.evictions,
            evictions_by_policy: self.evictions_by_policy.clone(),
            errors: self.errors,
            error_rate: self.error_rate(),
            errors_by_operation: self.errors_by_operation.clone(),
            throughput: if uptime > 0.0 {
                total_requests as f64 / uptime
            } else {
                0.0
            },
            avg_response_ms: self.avg_response_ms(),
            latency: self
                .latency
                .iter()
                .map(|(op, track)| (op.to_string(), track.summary()))
                .collect(),
            namespaces: self
                .namespaces
                .iter()
                .map(|(name, ns)| {
                    let lookups = ns.hits + ns.misses;
                    let summary = NamespaceSummary {
                        hits: ns.hits,
                        misses: ns.misses,
                        hit_ratio: if lookups == 0 {
                            0.0
                        } else {
                            ns.hits as f64 / lookups as f64
                        },
                        sets: ns.sets,
                        avg_entry_size: if ns.sets == 0 {
                            0.0
                        } else {
                            ns.total_size as f64 / ns.sets as f64
                        },
                    };
                    (name.clone(), summary)
                })
                .collect(),
            alert_count,
        }
    }
}

/// Cross-tier statistics collector
pub struct CacheStats {
    config: StatsConfig,
    inner: Mutex<StatsInner>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl std::fmt::Debug for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStats")
            .field("config", &self.config)
            .field("alerts", &self.alerts.lock().len())
            .finish()
    }
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}

impl CacheStats {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StatsInner::new()),
            alerts: Mutex::new(VecDeque::with_capacity(config.max_alerts)),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    fn observe(&self, inner: &mut StatsInner, operation: &'static str, latency: Duration) {
        let stride = self.config.sample_stride();
        let cap = self.config.sample_size;
        let ms = latency.as_secs_f64() * 1000.0;

        let track = inner.latency.entry(operation).or_default();
        track.count += 1;
        track.total_ms += ms;
        if cap > 0 && (track.count - 1) % stride == 0 {
            if track.reservoir.len() == cap {
                track.reservoir.pop_front();
            }
            track.reservoir.push_back(ms);
        }
    }

    /// Lookup served by `tier`
    pub fn record_hit(&self, tier: Tier, key: &str, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.hits += 1;
        *inner.tier_hits.entry(tier).or_insert(0) += 1;
        inner.namespace(key).hits += 1;
        self.observe(&mut inner, "get", latency);
    }

    /// Lookup served by no tier
    pub fn record_miss(&self, key: &str, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.misses += 1;
        inner.namespace(key).misses += 1;
        self.observe(&mut inner, "get", latency);
    }

    pub fn record_set(&self, key: &str, size: u64, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.sets += 1;
        let ns = inner.namespace(key);
        ns.sets += 1;
        ns.total_size += size;
        self.observe(&mut inner, "set", latency);
    }

    pub fn record_delete(&self, _key: &str) {
        self.inner.lock().deletes += 1;
    }

    /// Eviction pass; always raises an informational alert
    pub fn record_eviction(&self, policy: &str, count: u64) {
        {
            let mut inner = self.inner.lock();
            inner.evictions += count;
            *inner
                .evictions_by_policy
                .entry(policy.to_string())
                .or_insert(0) += count;
        }
        self.push_alert(
            "eviction",
            format!("Evicted {} entries using {} policy", count, policy),
            AlertSeverity::Info,
        );
    }

    pub fn record_error(&self, operation: &str, key: &str, error: &Error) {
        {
            let mut inner = self.inner.lock();
            inner.errors += 1;
            *inner
                .errors_by_operation
                .entry(operation.to_string())
                .or_insert(0) += 1;
        }
        debug!(
            category = "cache.stats",
            "Recorded {} error on {} '{}': {}",
            error.kind(),
            operation,
            key,
            error
        );
    }

    pub fn record_clear(&self, namespace: Option<&str>, pattern: Option<&str>) {
        self.inner.lock().clears += 1;
        debug!(
            category = "cache.stats",
            "Cleared namespace={:?} pattern={:?}", namespace, pattern
        );
    }

    /// Global hit ratio, `None` before the first lookup
    pub fn hit_ratio(&self) -> Option<f64> {
        self.inner.lock().hit_ratio()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let alert_count = self.alerts.lock().len();
        self.inner.lock().snapshot(alert_count)
    }

    /// Zero every counter, returning the totals accumulated so far
    ///
    /// Alerts are kept.
    pub fn reset(&self) -> StatsSnapshot {
        let alert_count = self.alerts.lock().len();
        let mut inner = self.inner.lock();
        let previous = inner.snapshot(alert_count);
        *inner = StatsInner::new();
        previous
    }

    fn push_alert(&self, alert_type: &str, message: String, severity: AlertSeverity) -> Alert {
        let alert = Alert {
            timestamp: Utc::now(),
            alert_type: alert_type.to_string(),
            message,
            severity,
        };
        let mut alerts = self.alerts.lock();
        if self.config.max_alerts > 0 {
            if alerts.len() >= self.config.max_alerts {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }
        alert
    }

    /// Compare the current metrics with the thresholds, raising one alert
    /// per breach
    pub fn check_thresholds(&self) -> Vec<Alert> {
        let (hit_ratio, avg_ms, error_rate) = {
            let inner = self.inner.lock();
            (inner.hit_ratio(), inner.avg_response_ms(), inner.error_rate())
        };
        let t = self.config.thresholds;
        let mut raised = Vec::new();

        if let Some(ratio) = hit_ratio {
            if ratio < t.hit_ratio {
                raised.push(self.push_alert(
                    "low_hit_ratio",
                    format!(
                        "Hit ratio {:.1}% below threshold {:.1}%",
                        ratio * 100.0,
                        t.hit_ratio * 100.0
                    ),
                    AlertSeverity::Warning,
                ));
            }
        }

        if avg_ms > t.avg_response_ms {
            raised.push(self.push_alert(
                "high_response_time",
                format!(
                    "Average response time {:.2}ms above threshold {:.2}ms",
                    avg_ms, t.avg_response_ms
                ),
                AlertSeverity::Warning,
            ));
        }

        if error_rate > t.error_rate {
            raised.push(self.push_alert(
                "high_error_rate",
                format!(
                    "Error rate {:.1}% above threshold {:.1}%",
                    error_rate * 100.0,
                    t.error_rate * 100.0
                ),
                AlertSeverity::Critical,
            ));
        }

        for alert in &raised {
            warn!(category = "cache.stats", "{}", alert.message);
        }
        raised
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn alerts_by_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.severity == severity)
            .cloned()
            .collect()
    }

    pub fn clear_alerts(&self) {
        self.alerts.lock().clear();
    }

    /// Log a summary and check thresholds every `report_interval`
    pub fn spawn_reporter(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.report_interval();
        tokio::spawn(async move { self.report_loop(period, shutdown).await })
    }

    #[instrument(skip(self, shutdown), name = "stats_report")]
    async fn report_loop(&self, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.snapshot();
                    info!(
                        category = "cache.stats",
                        requests = snapshot.total_requests,
                        hit_ratio = snapshot.hit_ratio,
                        error_rate = snapshot.error_rate,
                        avg_response_ms = snapshot.avg_response_ms,
                        "Cache stats report"
                    );
                    self.check_thresholds();
                }
            }
        }
        debug!(category = "cache.stats", "Stats reporter stopped");
    }
}

fn percentile(samples: &VecDeque<f64>, quantile: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * quantile).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// =============================================================================
// Tests
// =============================================================================
