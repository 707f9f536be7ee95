//! Cache Entry Types
//!
//! Tier-independent unit of storage: a JSON value plus the bookkeeping both
//! tiers share. Also home to the key helpers (namespace prefixing, stable
//! hashing, pattern filters).

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

/// Default entry priority
pub const DEFAULT_PRIORITY: u8 = 5;

/// Highest allowed priority
pub const MAX_PRIORITY: u8 = 10;

/// Namespace used when the caller does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Separator between namespace and raw key
pub const NAMESPACE_SEPARATOR: char = ':';

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Duration in milliseconds, saturating at `i64::MAX`
#[inline]
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Absolute expiry of a TTL starting at `now`; `None` if it lies beyond
/// the representable range, so the entry never expires
#[inline]
pub fn expiry_after(now: i64, ttl: Duration) -> Option<i64> {
    i64::try_from(ttl.as_millis()).ok().and_then(|ms| now.checked_add(ms))
}

/// Fast non-cryptographic hash (FxHash algorithm)
///
/// Pure function of the input, so it is safe to derive on-disk names from.
#[inline]
pub fn stable_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Build the full `namespace:rawKey` form
pub fn full_key(namespace: &str, raw: &str) -> String {
    format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, raw)
}

/// Namespace part of a full key, if it has one
pub fn namespace_of(full_key: &str) -> Option<&str> {
    full_key
        .split_once(NAMESPACE_SEPARATOR)
        .map(|(namespace, _)| namespace)
}

/// Serialized byte length of a value
pub fn serialized_size(value: &Value) -> Result<u64> {
    Ok(serde_json::to_vec(value)?.len() as u64)
}

/// Clamp a caller-supplied priority into 0..=10
#[inline]
pub fn clamp_priority(priority: u8) -> u8 {
    priority.min(MAX_PRIORITY)
}

// =============================================================================
// Entry Metadata
// =============================================================================

/// Bookkeeping for one entry (shared by both tiers and the L2 index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Priority 0-10
    pub priority: u8,
    /// Creation time (epoch ms)
    pub created_at: i64,
    /// Last access time (epoch ms)
    pub last_accessed: i64,
    /// Number of hits since insertion
    pub access_count: u64,
    /// Absolute expiry (epoch ms), `None` = never expires
    pub ttl_absolute: Option<i64>,
    /// Stored byte length (after compression when compressed)
    pub size_bytes: u64,
    /// Whether the stored form is compressed
    pub compressed: bool,
    /// Compression algorithm of the stored form
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
}

impl EntryMetadata {
    /// Create metadata for a freshly inserted entry
    pub fn new(size_bytes: u64, ttl: Option<Duration>, priority: u8) -> Self {
        let now = now_ms();
        Self {
            priority: clamp_priority(priority),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_absolute: ttl.and_then(|ttl| expiry_after(now, ttl)),
            size_bytes,
            compressed: false,
            algorithm: CompressionAlgorithm::None,
        }
    }

    /// Mark the stored form as compressed with the given algorithm
    pub fn with_compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compressed = algorithm != CompressionAlgorithm::None;
        self.algorithm = algorithm;
        self
    }

    /// Expired as of `now`?
    #[inline]
    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.ttl_absolute, Some(expiry) if now > expiry)
    }

    /// Expired right now?
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Time left before expiry (`None` when the entry never expires)
    pub fn remaining_ttl(&self, now: i64) -> Option<Duration> {
        self.ttl_absolute
            .map(|expiry| Duration::from_millis(expiry.saturating_sub(now).max(0) as u64))
    }

    /// Record a hit
    #[inline]
    pub fn record_access(&mut self, now: i64) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Value plus metadata as held by the memory tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached value
    pub value: Value,
    /// Entry metadata
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create an entry, computing its serialized size
    pub fn new(value: Value, ttl: Option<Duration>, priority: u8) -> Result<Self> {
        let size = serialized_size(&value)?;
        Ok(Self {
            value,
            metadata: EntryMetadata::new(size, ttl, priority),
        })
    }

    /// Stored size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size_bytes
    }

    /// Check if expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }
}

// =============================================================================
// Key Filter
// =============================================================================

/// Namespace restriction plus optional glob pattern (`*`, `?`)
///
/// With a namespace, the pattern is matched against the raw key (the part
/// after `namespace:`); without one it is matched against the full key.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    prefix: Option<String>,
    pattern: Option<Regex>,
}

impl KeyFilter {
    /// Filter that matches every key
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from the optional parts
    pub fn new(pattern: Option<&str>, namespace: Option<&str>) -> Result<Self> {
        let pattern = match pattern {
            Some(glob) => Some(Self::compile(glob)?),
            None => None,
        };
        Ok(Self {
            prefix: namespace.map(|ns| format!("{}{}", ns, NAMESPACE_SEPARATOR)),
            pattern,
        })
    }

    /// Filter restricted to one namespace
    pub fn namespace(namespace: &str) -> Self {
        Self {
            prefix: Some(format!("{}{}", namespace, NAMESPACE_SEPARATOR)),
            pattern: None,
        }
    }

    fn compile(glob: &str) -> Result<Regex> {
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        Regex::new(&expr).map_err(|e| Error::Config(format!("invalid key pattern '{}': {}", glob, e)))
    }

    /// Does the full key pass this filter?
    pub fn matches(&self, full_key: &str) -> bool {
        let subject = match &self.prefix {
            Some(prefix) => match full_key.strip_prefix(prefix.as_str()) {
                Some(rest) => rest,
                None => return false,
            },
            None => full_key,
        };
        self.pattern
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(subject))
    }

    /// True when the filter accepts everything
    pub fn is_unrestricted(&self) -> bool {
        self.prefix.is_none() && self.pattern.is_none()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_huge_ttl_never_expires() {
        let meta = EntryMetadata::new(5, Some(Duration::MAX), DEFAULT_PRIORITY);
        assert_eq!(meta.ttl_absolute, None);
        assert!(!meta.is_expired_at(i64::MAX));
        assert_eq!(meta.remaining_ttl(now_ms()), None);

        assert_eq!(expiry_after(i64::MAX - 10, Duration::from_millis(11)), None);
        assert_eq!(expiry_after(1_000, Duration::from_millis(500)), Some(1_500));
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_full_key_and_namespace() {
        let key = full_key("profiles", "acme.com");
        assert_eq!(key, "profiles:acme.com");
        assert_eq!(namespace_of(&key), Some("profiles"));
        assert_eq!(namespace_of("no-namespace"), None);
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"scraping:page-1"), stable_hash(b"scraping:page-1"));
        assert_ne!(stable_hash(b"scraping:page-1"), stable_hash(b"scraping:page-2"));
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = EntryMetadata::new(128, None, DEFAULT_PRIORITY);
        assert_eq!(meta.size_bytes, 128);
        assert_eq!(meta.priority, 5);
        assert_eq!(meta.access_count, 0);
        assert!(meta.ttl_absolute.is_none());
        assert!(!meta.is_expired());
        assert!(!meta.compressed);
    }

    #[test]
    fn test_metadata_priority_clamped() {
        let meta = EntryMetadata::new(1, None, 42);
        assert_eq!(meta.priority, MAX_PRIORITY);
    }

    #[test]
    fn test_metadata_expiry() {
        let mut meta = EntryMetadata::new(1, Some(Duration::from_millis(100)), 5);
        let expiry = meta.ttl_absolute.unwrap();
        assert!(!meta.is_expired_at(expiry));
        assert!(meta.is_expired_at(expiry + 1));

        meta.ttl_absolute = Some(now_ms() - 10);
        assert!(meta.is_expired());
        assert_eq!(meta.remaining_ttl(now_ms()), Some(Duration::ZERO));
    }

    #[test]
    fn test_metadata_access_tracking() {
        let mut meta = EntryMetadata::new(1, None, 5);
        meta.record_access(meta.created_at + 50);
        meta.record_access(meta.created_at + 80);
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_accessed, meta.created_at + 80);
    }

    #[test]
    fn test_metadata_index_format_is_camel_case() {
        let meta = EntryMetadata::new(10, Some(Duration::from_secs(1)), 5);
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("lastAccessed").is_some());
        assert!(json.get("ttlAbsolute").is_some());
        assert!(json.get("sizeBytes").is_some());
    }

    #[test]
    fn test_cache_entry_size_is_serialized_length() {
        let value = json!({"lang": "en"});
        let entry = CacheEntry::new(value.clone(), None, 5).unwrap();
        assert_eq!(entry.size(), serde_json::to_vec(&value).unwrap().len() as u64);
    }

    #[test]
    fn test_key_filter_namespace_only() {
        let filter = KeyFilter::namespace("scraping");
        assert!(filter.matches("scraping:page"));
        assert!(!filter.matches("profiles:page"));
        assert!(!filter.matches("scrapingx:page"));
    }

    #[test]
    fn test_key_filter_pattern_within_namespace() {
        let filter = KeyFilter::new(Some("page-*"), Some("scraping")).unwrap();
        assert!(filter.matches("scraping:page-1"));
        assert!(!filter.matches("scraping:profile-1"));
        assert!(!filter.matches("temp:page-1"));
    }

    #[test]
    fn test_key_filter_pattern_on_full_key() {
        let filter = KeyFilter::new(Some("*:acme.?om"), None).unwrap();
        assert!(filter.matches("profiles:acme.com"));
        assert!(!filter.matches("profiles:acme.org"));
        assert!(KeyFilter::all().matches("anything"));
        assert!(KeyFilter::all().is_unrestricted());
    }

    #[test]
    fn test_key_filter_escapes_regex_characters() {
        let filter = KeyFilter::new(Some("a.b+c"), None).unwrap();
        assert!(filter.matches("a.b+c"));
        assert!(!filter.matches("aXbbc"));
    }
}
