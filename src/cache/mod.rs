//! Two-Tier Cache
//!
//! In-memory L1 in front of a file-backed L2, with pluggable eviction,
//! statistics and alerting, and proactive warming.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Manager                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 MemoryCache              │  L2 FileCache                              │
//! │  ┌────────────────────────┐  │  ┌──────────────────────────────────────┐  │
//! │  │ HashMap + byte budget  │  │  │ one file per entry + index.json      │  │
//! │  │ default 100 MB, 1h TTL │  │  │ default 1 GB, 24h TTL, gzip/lz4      │  │
//! │  └────────────────────────┘  │  └──────────────────────────────────────┘  │
//! │            ▲ promotion       │              ▲ write-through               │
//! │            └─────────────────┴──────────────┘                             │
//! │                                                                          │
//! │  EvictionPolicy (lru/lfu/priority/size/ttl/hybrid/adaptive)               │
//! │  CacheStats (hits, misses, latency, alerts)   CacheWarmer (strategies)   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Background Tasks
//!
//! - L1 expiry sweep (60s)
//! - L2 index persistence, debounced 5s after the last mutation
//! - Scheduled eviction (5 min, 10%)
//! - Stats report and threshold check (5 min)
//! - Warmup queue drain (when entries come due)

pub mod compression;
mod config;
mod entry;
mod flush;
mod l1;
mod l2;
mod manager;
mod namespace;
mod policy;
mod stats;
mod warmer;

#[cfg(test)]
mod proptest;

pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use config::{CacheConfig, ConfigReport, EvictionConfig, NamespaceSettings};
pub use entry::{
    clamp_priority, full_key, namespace_of, now_ms, serialized_size, stable_hash, CacheEntry,
    EntryMetadata, KeyFilter, DEFAULT_NAMESPACE, DEFAULT_PRIORITY, MAX_PRIORITY, NAMESPACE_SEPARATOR,
};
pub use flush::{DebouncedFlush, FlushTarget};
pub use l1::{MemoryCache, MemoryCacheConfig};
pub use l2::{file_name_for, FileCache, FileCacheConfig, IndexRecord, RepairReport, ENTRY_EXTENSION, INDEX_FILE};
pub use manager::{
    health_score, peek_metadata, unwrap_stored, CacheManager, CacheReport, ClearOptions, EvictOptions,
    EvictionOutcome, GetOptions, SetOptions, ValueMetadata,
};
pub use namespace::NamespacedCache;
pub use policy::{
    AdaptiveThresholds, EvictionCandidate, EvictionPolicy, EvictionReport, EvictionRequest,
    EvictionStrategy, EvictionTarget, HybridWeights, PromotionPolicy, ResolvedEviction, TierUsage,
    WEIGHT_SUM_TOLERANCE,
};
pub use stats::{
    Alert, AlertSeverity, AlertThresholds, CacheStats, LatencySummary, NamespaceSummary, StatsConfig,
    StatsSnapshot, Tier, TierCounters, TierStats, TIER_MIN_HIT_RATIO, TIER_MIN_LOOKUPS, TIER_USAGE_LIMIT,
};
pub use warmer::{
    CacheWarmer, DomainProfileWarmup, PopularSearchWarmup, ProfileRecord, ProfileSource, RecentEntry,
    RecentEntrySource, RecentFilesWarmup, ScheduledWarmup, SearchHistorySource, SearchRecord,
    StrategyResult, StrategySettings, StrategyStats, UserPreferenceRecord, UserPreferenceSource,
    UserPreferenceWarmup, WarmEntry, WarmerConfig, WarmerStats, WarmerStrategies, WarmupKind,
    WarmupResult, WarmupSink, WarmupSources, WarmupStrategy,
};
