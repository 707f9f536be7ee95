//! Cache Configuration
//!
//! One immutable value handed to [`CacheManager::new`](super::CacheManager::new).
//! Loadable from YAML; every field has a default, so a partial file is fine:
//!
//! ```yaml
//! l1:
//!   max_size_mb: 64
//! l2:
//!   base_dir: /var/cache/tiercache
//!   compression:
//!     algorithm: lz4
//! eviction:
//!   policy: hybrid
//!   weights: { recency: 0.4, frequency: 0.2, priority: 0.2, size: 0.1, age: 0.1 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::compression::CompressionAlgorithm;
use super::entry::{DEFAULT_NAMESPACE, MAX_PRIORITY};
use super::l1::MemoryCacheConfig;
use super::l2::FileCacheConfig;
use super::policy::{AdaptiveThresholds, EvictionPolicy, EvictionStrategy, HybridWeights, PromotionPolicy};
use super::stats::StatsConfig;
use super::warmer::WarmerConfig;
use crate::error::{Error, Result};

/// Scheduled eviction settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Policy of the periodic sweep
    pub policy: EvictionStrategy,
    /// Sweep period
    pub interval_secs: u64,
    /// Share of candidates removed per sweep (0-100)
    pub percentage: f64,
    pub weights: HybridWeights,
    pub adaptive: AdaptiveThresholds,
    /// Upper bound on a single delete during a pass
    pub delete_timeout_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionStrategy::Adaptive,
            interval_secs: 300,
            percentage: 10.0,
            weights: HybridWeights::default(),
            adaptive: AdaptiveThresholds::default(),
            delete_timeout_ms: 5000,
        }
    }
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Build the policy, rejecting invalid hybrid weights
    pub fn build_policy(&self) -> Result<EvictionPolicy> {
        Ok(EvictionPolicy::new(self.weights, self.adaptive)?
            .with_delete_timeout(Duration::from_millis(self.delete_timeout_ms)))
    }
}

/// Defaults applied to one namespace when the caller gives none
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceSettings {
    pub default_ttl_ms: Option<u64>,
    pub priority: u8,
}

impl Default for NamespaceSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: None,
            priority: 5,
        }
    }
}

impl NamespaceSettings {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}

fn default_namespaces() -> BTreeMap<String, NamespaceSettings> {
    let ns = |ttl_ms: Option<u64>, priority: u8| NamespaceSettings {
        default_ttl_ms: ttl_ms,
        priority,
    };
    [
        (DEFAULT_NAMESPACE, ns(None, 5)),
        ("scraping", ns(Some(6 * 3600 * 1000), 5)),
        ("profiles", ns(Some(24 * 3600 * 1000), 7)),
        ("users", ns(Some(12 * 3600 * 1000), 6)),
        ("monitoring", ns(Some(5 * 60 * 1000), 3)),
        ("temp", ns(Some(15 * 60 * 1000), 1)),
    ]
    .into_iter()
    .map(|(name, settings)| (name.to_string(), settings))
    .collect()
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: MemoryCacheConfig,
    pub l2: FileCacheConfig,
    pub eviction: EvictionConfig,
    pub promotion: PromotionPolicy,
    pub stats: StatsConfig,
    pub warmer: WarmerConfig,
    pub namespaces: BTreeMap<String, NamespaceSettings>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: MemoryCacheConfig::default(),
            l2: FileCacheConfig::default(),
            eviction: EvictionConfig::default(),
            promotion: PromotionPolicy::default(),
            stats: StatsConfig::default(),
            warmer: WarmerConfig::default(),
            namespaces: default_namespaces(),
        }
    }
}

/// Findings of [`CacheConfig::validate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err(Error::Config)` listing every error
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

impl CacheConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Settings of a namespace (falls back to the `default` entry)
    pub fn namespace(&self, name: &str) -> NamespaceSettings {
        self.namespaces
            .get(name)
            .or_else(|| self.namespaces.get(DEFAULT_NAMESPACE))
            .copied()
            .unwrap_or_default()
    }

    /// Check every knob; errors make the manager refuse to start
    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();
        let mut error = |msg: String| report.errors.push(msg);

        if let Err(e) = self.eviction.weights.validate() {
            error(e.to_string());
        }
        if self.l1.max_size_mb <= 0.0 {
            error(format!("l1.max_size_mb must be positive (got {})", self.l1.max_size_mb));
        }
        if self.l2.max_size_mb <= 0.0 {
            error(format!("l2.max_size_mb must be positive (got {})", self.l2.max_size_mb));
        }
        for (name, target) in [("l1", self.l1.eviction_target), ("l2", self.l2.eviction_target)] {
            if target <= 0.0 || target > 1.0 {
                error(format!("{}.eviction_target must be in (0, 1] (got {})", name, target));
            }
        }

        let adaptive = &self.eviction.adaptive;
        for (name, value) in [
            ("hit_ratio_low", adaptive.hit_ratio_low),
            ("hit_ratio_high", adaptive.hit_ratio_high),
            ("usage_high", adaptive.usage_high),
        ] {
            if !in_unit_range(value) {
                error(format!("eviction.adaptive.{} must be in [0, 1] (got {})", name, value));
            }
        }
        if adaptive.hit_ratio_low >= adaptive.hit_ratio_high {
            error(format!(
                "eviction.adaptive.hit_ratio_low ({}) must be below hit_ratio_high ({})",
                adaptive.hit_ratio_low, adaptive.hit_ratio_high
            ));
        }
        if self.eviction.percentage <= 0.0 || self.eviction.percentage > 100.0 {
            error(format!(
                "eviction.percentage must be in (0, 100] (got {})",
                self.eviction.percentage
            ));
        }

        let thresholds = &self.stats.thresholds;
        if !in_unit_range(thresholds.hit_ratio) {
            error(format!("stats.thresholds.hit_ratio must be in [0, 1] (got {})", thresholds.hit_ratio));
        }
        if !in_unit_range(thresholds.error_rate) {
            error(format!("stats.thresholds.error_rate must be in [0, 1] (got {})", thresholds.error_rate));
        }
        if self.stats.sampling_rate <= 0.0 || self.stats.sampling_rate > 1.0 {
            error(format!("stats.sampling_rate must be in (0, 1] (got {})", self.stats.sampling_rate));
        }

        if self.warmer.max_concurrency == 0 {
            error("warmer.max_concurrency must be at least 1".to_string());
        }
        if self.l2.batch_concurrency == 0 {
            error("l2.batch_concurrency must be at least 1".to_string());
        }
        let compression = &self.l2.compression;
        if compression.algorithm == CompressionAlgorithm::Gzip && compression.level > 9 {
            error(format!("gzip compression level must be 0-9 (got {})", compression.level));
        }

        let mut warn = |msg: String| report.warnings.push(msg);
        if self.l1.max_size_mb > self.l2.max_size_mb {
            warn(format!(
                "L1 ({} MB) is larger than L2 ({} MB)",
                self.l1.max_size_mb, self.l2.max_size_mb
            ));
        }
        if self.promotion.max_promote_bytes > self.l1.max_bytes() {
            warn(format!(
                "promotion.max_promote_bytes ({}) exceeds L1 capacity ({} bytes)",
                self.promotion.max_promote_bytes,
                self.l1.max_bytes()
            ));
        }
        if self.l1.default_ttl_ms > self.l2.default_ttl_ms {
            warn("L1 default TTL is longer than L2 default TTL".to_string());
        }
        for (name, settings) in &self.namespaces {
            if settings.priority > MAX_PRIORITY {
                warn(format!(
                    "namespace '{}' priority {} will be clamped to {}",
                    name, settings.priority, MAX_PRIORITY
                ));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        let report = CacheConfig::default().validate();
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = CacheConfig::from_yaml_str(
            r#"
l1:
  max_size_mb: 64
  eviction_policy: lfu
l2:
  base_dir: /tmp/tiercache
  compression:
    algorithm: lz4
eviction:
  policy: hybrid
  weights: { recency: 0.4, frequency: 0.2, priority: 0.2, size: 0.1, age: 0.1 }
namespaces:
  sessions: { default_ttl_ms: 600000, priority: 4 }
"#,
        )
        .unwrap();

        assert_eq!(config.l1.max_size_mb, 64.0);
        assert_eq!(config.l1.eviction_policy, EvictionStrategy::Lfu);
        assert_eq!(config.l1.cleanup_interval_secs, 60);
        assert_eq!(config.l2.compression.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(config.l2.index_flush_delay_ms, 5000);
        assert_eq!(config.eviction.policy, EvictionStrategy::Hybrid);
        assert_eq!(config.eviction.weights.recency, 0.4);
        assert_eq!(config.namespace("sessions").default_ttl(), Some(Duration::from_secs(600)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_namespace_uses_default() {
        let config = CacheConfig::default();
        assert_eq!(config.namespace("nope"), config.namespace(DEFAULT_NAMESPACE));
        assert_eq!(config.namespace("profiles").priority, 7);
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut config = CacheConfig::default();
        config.eviction.weights.recency = 0.1;
        let report = config.validate();
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("sum to 1.0"));
        assert_matches!(config.eviction.build_policy(), Err(Error::InvalidWeights { .. }));
    }

    #[test]
    fn test_threshold_errors() {
        let mut config = CacheConfig::default();
        config.eviction.adaptive.hit_ratio_low = 0.9;
        config.stats.sampling_rate = 0.0;
        config.l1.max_size_mb = 0.0;
        let report = config.validate();
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert_matches!(report.into_result(), Err(Error::Config(_)));
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let mut config = CacheConfig::default();
        config.l1.max_size_mb = 4096.0;
        let report = config.validate();
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 1);

        config.l1.max_size_mb = 0.05;
        let warnings = config.validate().into_result().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("promotion"));
    }

    #[test]
    fn test_invalid_yaml() {
        assert_matches!(CacheConfig::from_yaml_str("l1: [oops"), Err(Error::ConfigParse(_)));
    }
}
