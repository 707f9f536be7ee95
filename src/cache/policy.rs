//! Eviction and Promotion Policies
//!
//! Stateless strategy library shared by both tiers. A policy computes an
//! eviction order over a candidate set and removes the selected keys through
//! the tier's own delete, so tier bookkeeping stays consistent.
//!
//! # Strategies
//!
//! | Name | Evicts first |
//! |------|--------------|
//! | `lru` | oldest `last_accessed` |
//! | `lfu` | lowest `access_count` |
//! | `priority` | lowest priority |
//! | `size` | largest `size_bytes` |
//! | `ttl` | already expired, then soonest to expire within the horizon |
//! | `hybrid` | lowest weighted composite score |
//! | `adaptive` | picks one of the above from hit ratio and usage |

use std::cmp::Ordering;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::entry::{duration_ms, now_ms, EntryMetadata, KeyFilter};
use crate::error::{Error, Result};

/// Tolerance on the hybrid weight sum
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

// =============================================================================
// Strategy
// =============================================================================

/// Eviction strategy, selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Priority,
    Size,
    Ttl,
    Hybrid,
    Adaptive,
}

impl EvictionStrategy {
    /// Policy name as used in configuration and stats
    pub fn name(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Lfu => "lfu",
            EvictionStrategy::Priority => "priority",
            EvictionStrategy::Size => "size",
            EvictionStrategy::Ttl => "ttl",
            EvictionStrategy::Hybrid => "hybrid",
            EvictionStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EvictionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            "priority" => Ok(EvictionStrategy::Priority),
            "size" => Ok(EvictionStrategy::Size),
            "ttl" => Ok(EvictionStrategy::Ttl),
            "hybrid" => Ok(EvictionStrategy::Hybrid),
            "adaptive" => Ok(EvictionStrategy::Adaptive),
            other => Err(Error::Config(format!("unknown eviction policy '{}'", other))),
        }
    }
}

// =============================================================================
// Weights and Thresholds
// =============================================================================

/// Weights of the hybrid composite score; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub recency: f64,
    pub frequency: f64,
    pub priority: f64,
    pub size: f64,
    pub age: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            recency: 0.30,
            frequency: 0.25,
            priority: 0.25,
            size: 0.10,
            age: 0.10,
        }
    }
}

impl HybridWeights {
    /// Sum of all weights
    pub fn sum(&self) -> f64 {
        self.recency + self.frequency + self.priority + self.size + self.age
    }

    /// Reject weights that are negative or do not sum to 1.0 (+/- 0.01)
    pub fn validate(&self) -> Result<()> {
        let parts = [self.recency, self.frequency, self.priority, self.size, self.age];
        let sum = self.sum();
        if parts.iter().any(|w| *w < 0.0 || !w.is_finite())
            || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE
        {
            return Err(Error::InvalidWeights { sum });
        }
        Ok(())
    }
}

/// Thresholds and multipliers of the adaptive meta-strategy
///
/// The multipliers are tuning defaults, not correctness requirements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThresholds {
    /// Below this hit ratio switch to LFU
    pub hit_ratio_low: f64,
    /// Above this hit ratio switch to LRU
    pub hit_ratio_high: f64,
    /// Above this usage ratio switch to size
    pub usage_high: f64,
    pub low_hit_multiplier: f64,
    pub low_hit_cap: f64,
    pub high_hit_multiplier: f64,
    pub high_hit_floor: f64,
    pub high_usage_multiplier: f64,
    pub high_usage_cap: f64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            hit_ratio_low: 0.70,
            hit_ratio_high: 0.85,
            usage_high: 0.85,
            low_hit_multiplier: 1.5,
            low_hit_cap: 40.0,
            high_hit_multiplier: 0.7,
            high_hit_floor: 10.0,
            high_usage_multiplier: 1.3,
            high_usage_cap: 35.0,
        }
    }
}

// =============================================================================
// Candidates and Targets
// =============================================================================

/// Snapshot of one entry's bookkeeping, as seen by the policy
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub key: String,
    pub priority: u8,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    pub ttl_absolute: Option<i64>,
    pub size_bytes: u64,
    /// Tier-local access order, breaks timestamp ties (lower = older)
    pub sequence: u64,
}

impl EvictionCandidate {
    /// Build from entry metadata
    pub fn from_metadata(key: impl Into<String>, meta: &EntryMetadata, sequence: u64) -> Self {
        Self {
            key: key.into(),
            priority: meta.priority,
            created_at: meta.created_at,
            last_accessed: meta.last_accessed,
            access_count: meta.access_count,
            ttl_absolute: meta.ttl_absolute,
            size_bytes: meta.size_bytes,
            sequence,
        }
    }

    fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.ttl_absolute, Some(expiry) if now > expiry)
    }
}

/// Capacity view of a tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// Tier-local hit ratio, `None` before any lookup
    pub hit_ratio: Option<f64>,
}

impl TierUsage {
    /// Used / max, 0.0 for a zero-sized tier
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.max_bytes as f64
        }
    }
}

/// A tier the policy can evict from
#[async_trait]
pub trait EvictionTarget: Send + Sync {
    /// Tier label for logs and reports
    fn tier_name(&self) -> &'static str;

    /// Current candidates passing the filter
    fn eviction_candidates(&self, filter: &KeyFilter) -> Vec<EvictionCandidate>;

    /// Current usage
    fn usage(&self) -> TierUsage;

    /// Remove one key through the tier's own delete path
    async fn evict_key(&self, key: &str) -> Result<bool>;
}

// =============================================================================
// Requests and Reports
// =============================================================================

/// One eviction pass against one tier
#[derive(Debug, Clone)]
pub struct EvictionRequest {
    pub strategy: EvictionStrategy,
    /// Share of current candidates to remove, 0-100
    pub percentage: f64,
    pub namespace: Option<String>,
    /// Hit ratio override (e.g. the global ratio); tier ratio when `None`
    pub hit_ratio: Option<f64>,
}

impl EvictionRequest {
    pub fn new(strategy: EvictionStrategy, percentage: f64) -> Self {
        Self {
            strategy,
            percentage,
            namespace: None,
            hit_ratio: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_hit_ratio(mut self, hit_ratio: Option<f64>) -> Self {
        self.hit_ratio = hit_ratio;
        self
    }
}

/// Concrete strategy and percentage after adaptive resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedEviction {
    pub strategy: EvictionStrategy,
    pub percentage: f64,
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionReport {
    pub tier: String,
    pub requested: EvictionStrategy,
    pub applied: EvictionStrategy,
    pub percentage: f64,
    pub candidates: usize,
    pub targeted: usize,
    pub evicted: usize,
    pub failed: usize,
}

// =============================================================================
// Eviction Policy
// =============================================================================

/// Eviction policy configuration and algorithms
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    weights: HybridWeights,
    adaptive: AdaptiveThresholds,
    /// TTL strategy looks this far ahead for soon-to-expire entries
    ttl_horizon: Duration,
    /// Upper bound on a single delete during a pass
    delete_timeout: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            weights: HybridWeights::default(),
            adaptive: AdaptiveThresholds::default(),
            ttl_horizon: Duration::from_secs(300),
            delete_timeout: Duration::from_secs(5),
        }
    }
}

impl EvictionPolicy {
    /// Create a policy, rejecting hybrid weights that do not sum to 1.0
    pub fn new(weights: HybridWeights, adaptive: AdaptiveThresholds) -> Result<Self> {
        weights.validate()?;
        Ok(Self {
            weights,
            adaptive,
            ..Default::default()
        })
    }

    /// Override the per-delete timeout
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Hybrid weights in use
    pub fn weights(&self) -> &HybridWeights {
        &self.weights
    }

    /// Resolve `adaptive` into a concrete strategy and percentage
    pub fn resolve(
        &self,
        strategy: EvictionStrategy,
        percentage: f64,
        hit_ratio: Option<f64>,
        usage_ratio: f64,
    ) -> ResolvedEviction {
        let percentage = percentage.clamp(0.0, 100.0);
        if strategy != EvictionStrategy::Adaptive {
            return ResolvedEviction {
                strategy,
                percentage,
            };
        }

        let t = &self.adaptive;
        let (strategy, percentage) = match hit_ratio {
            Some(ratio) if ratio < t.hit_ratio_low => (
                EvictionStrategy::Lfu,
                (percentage * t.low_hit_multiplier).min(t.low_hit_cap),
            ),
            Some(ratio) if ratio > t.hit_ratio_high => (
                EvictionStrategy::Lru,
                (percentage * t.high_hit_multiplier).max(t.high_hit_floor),
            ),
            _ if usage_ratio > t.usage_high => (
                EvictionStrategy::Size,
                (percentage * t.high_usage_multiplier).min(t.high_usage_cap),
            ),
            _ => (EvictionStrategy::Hybrid, percentage),
        };

        debug!(
            category = "cache.evict",
            "Adaptive eviction resolved to {} at {:.1}% (hit ratio {:?}, usage {:.2})",
            strategy,
            percentage,
            hit_ratio,
            usage_ratio
        );
        ResolvedEviction {
            strategy,
            percentage,
        }
    }

    /// Sort candidates so the first one is evicted first
    ///
    /// `adaptive` must be resolved beforehand; it orders like `hybrid` here.
    pub fn order(&self, strategy: EvictionStrategy, candidates: &mut Vec<EvictionCandidate>, now: i64) {
        let tie = |a: &EvictionCandidate, b: &EvictionCandidate| a.sequence.cmp(&b.sequence);
        match strategy {
            EvictionStrategy::Lru => candidates.sort_by(|a, b| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then_with(|| tie(a, b))
            }),
            EvictionStrategy::Lfu => candidates.sort_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then_with(|| a.last_accessed.cmp(&b.last_accessed))
                    .then_with(|| tie(a, b))
            }),
            EvictionStrategy::Priority => candidates.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.last_accessed.cmp(&b.last_accessed))
                    .then_with(|| tie(a, b))
            }),
            EvictionStrategy::Size => candidates.sort_by(|a, b| {
                b.size_bytes.cmp(&a.size_bytes).then_with(|| tie(a, b))
            }),
            EvictionStrategy::Ttl => {
                let horizon = now.saturating_add(duration_ms(self.ttl_horizon));
                candidates.sort_by_key(|c| {
                    let class = match c.ttl_absolute {
                        Some(expiry) if expiry < now => 0u8,
                        Some(expiry) if expiry <= horizon => 1,
                        _ => 2,
                    };
                    let when = match class {
                        2 => c.last_accessed,
                        _ => c.ttl_absolute.unwrap_or(i64::MAX),
                    };
                    (class, when, c.sequence)
                });
            }
            EvictionStrategy::Hybrid | EvictionStrategy::Adaptive => {
                let scores = self.hybrid_scores(candidates);
                let mut scored: Vec<(f64, EvictionCandidate)> =
                    scores.into_iter().zip(candidates.drain(..)).collect();
                scored.sort_by(|(sa, a), (sb, b)| {
                    sa.partial_cmp(sb)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| tie(a, b))
                });
                candidates.extend(scored.into_iter().map(|(_, c)| c));
            }
        }
    }

    /// Composite keep-score per candidate (0-100, lowest evicted first)
    pub fn hybrid_scores(&self, candidates: &[EvictionCandidate]) -> Vec<f64> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let (min_last, max_last) = min_max(candidates.iter().map(|c| c.last_accessed));
        let (min_created, max_created) = min_max(candidates.iter().map(|c| c.created_at));
        let max_count = candidates.iter().map(|c| c.access_count).max().unwrap_or(0);
        let max_size = candidates.iter().map(|c| c.size_bytes).max().unwrap_or(0);
        let w = &self.weights;

        candidates
            .iter()
            .map(|c| {
                let recency = normalize(c.last_accessed, min_last, max_last);
                let frequency = if max_count == 0 {
                    0.0
                } else {
                    (c.access_count as f64).ln_1p() / (max_count as f64).ln_1p() * 100.0
                };
                let priority = c.priority as f64 / 10.0 * 100.0;
                let size = if max_size == 0 {
                    100.0
                } else {
                    (1.0 - c.size_bytes as f64 / max_size as f64) * 100.0
                };
                let age = normalize(c.created_at, min_created, max_created);

                w.recency * recency
                    + w.frequency * frequency
                    + w.priority * priority
                    + w.size * size
                    + w.age * age
            })
            .collect()
    }

    /// Pick the keys a pass should remove
    ///
    /// The target is `ceil(percentage% of all candidates)`. The TTL strategy
    /// only ever selects entries that are expired or expire within the
    /// horizon.
    pub fn select(
        &self,
        strategy: EvictionStrategy,
        mut candidates: Vec<EvictionCandidate>,
        percentage: f64,
        now: i64,
    ) -> Vec<EvictionCandidate> {
        let total = candidates.len();
        let target = ((total as f64) * percentage.clamp(0.0, 100.0) / 100.0).ceil() as usize;

        if strategy == EvictionStrategy::Ttl {
            let horizon = now.saturating_add(duration_ms(self.ttl_horizon));
            candidates.retain(|c| matches!(c.ttl_absolute, Some(expiry) if expiry <= horizon));
        }

        self.order(strategy, &mut candidates, now);
        candidates.truncate(target);
        candidates
    }

    /// Run one eviction pass against a tier
    pub async fn apply(&self, tier: &dyn EvictionTarget, request: &EvictionRequest) -> EvictionReport {
        let usage = tier.usage();
        let hit_ratio = request.hit_ratio.or(usage.hit_ratio);
        let resolved = self.resolve(
            request.strategy,
            request.percentage,
            hit_ratio,
            usage.usage_ratio(),
        );

        let filter = request
            .namespace
            .as_deref()
            .map(KeyFilter::namespace)
            .unwrap_or_default();
        let candidates = tier.eviction_candidates(&filter);
        let candidate_count = candidates.len();
        let now = now_ms();
        let selected = self.select(resolved.strategy, candidates, resolved.percentage, now);

        let mut report = EvictionReport {
            tier: tier.tier_name().to_string(),
            requested: request.strategy,
            applied: resolved.strategy,
            percentage: resolved.percentage,
            candidates: candidate_count,
            targeted: selected.len(),
            evicted: 0,
            failed: 0,
        };

        for candidate in selected {
            match tokio::time::timeout(self.delete_timeout, tier.evict_key(&candidate.key)).await {
                Ok(Ok(true)) => report.evicted += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        category = "cache.evict",
                        "Failed to evict {} from {}: {}", candidate.key, report.tier, e
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        category = "cache.evict",
                        "Evicting {} from {} timed out after {:?}",
                        candidate.key,
                        report.tier,
                        self.delete_timeout
                    );
                }
            }
        }

        debug!(
            category = "cache.evict",
            "{} pass on {}: {}/{} evicted ({} failed)",
            report.applied,
            report.tier,
            report.evicted,
            report.targeted,
            report.failed
        );
        report
    }

    /// Evict until `used` drops to `target` bytes (capacity pressure)
    ///
    /// Returns the keys to remove, in order. Used by the tiers themselves
    /// while they hold their own lock.
    pub fn plan_bytes(
        &self,
        strategy: EvictionStrategy,
        mut candidates: Vec<EvictionCandidate>,
        used: u64,
        target: u64,
        now: i64,
    ) -> Vec<EvictionCandidate> {
        let strategy = match strategy {
            EvictionStrategy::Adaptive => EvictionStrategy::Hybrid,
            other => other,
        };
        self.order(strategy, &mut candidates, now);

        let mut remaining = used;
        let mut plan = Vec::new();
        for candidate in candidates {
            if remaining <= target {
                break;
            }
            remaining = remaining.saturating_sub(candidate.size_bytes);
            plan.push(candidate);
        }
        plan
    }
}

fn min_max(values: impl Iterator<Item = i64>) -> (i64, i64) {
    values.fold((i64::MAX, i64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

fn normalize(value: i64, min: i64, max: i64) -> f64 {
    if max <= min {
        100.0
    } else {
        (value - min) as f64 / (max - min) as f64 * 100.0
    }
}

// =============================================================================
// Promotion Policy
// =============================================================================

/// Admission rule for copying values into the memory tier
///
/// Admit unless the wrapped size exceeds `max_promote_bytes`; a priority of
/// `force_priority` or more admits regardless of size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionPolicy {
    pub max_promote_bytes: u64,
    pub force_priority: u8,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            max_promote_bytes: 100_000,
            force_priority: 8,
        }
    }
}

impl PromotionPolicy {
    /// Should a value of this size and priority live in L1?
    pub fn should_admit(&self, size: u64, priority: u8) -> bool {
        priority >= self.force_priority || size <= self.max_promote_bytes
    }
}

// =============================================================================
// Tests
// =============================================================================
