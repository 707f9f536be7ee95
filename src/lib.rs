//! tiercache - Two-Tier Caching Engine
//!
//! An in-memory L1 in front of a persistent, file-backed L2, with pluggable
//! eviction (LRU, LFU, priority, size, TTL, hybrid and adaptive), statistics
//! with threshold alerting, and proactive cache warming.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheManager ──▶ MemoryCache (L1) ──miss──▶ FileCache (L2)
//!                 │                  ▲                        │
//!                 │                  └──── promotion ◀────────┘
//!                 ├──▶ EvictionPolicy (scheduled + on demand)
//!                 ├──▶ CacheStats (hits, latency, alerts)
//!                 └──▶ CacheWarmer (strategy registry)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, eviction, stats, warming and the manager facade
//! - [`error`] - Error types
//! - [`monitoring`] - Health aggregation and Prometheus exposition

pub mod cache;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{
    CacheConfig, CacheManager, CacheStats, CacheWarmer, EvictionPolicy, EvictionStrategy, FileCache,
    GetOptions, MemoryCache, NamespacedCache, SetOptions,
};
pub use error::{Error, Result};
pub use monitoring::{HealthReport, HealthStatus};
