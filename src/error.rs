//! Error types for the tiered cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache engine
///
/// None of these escape the [`CacheManager`](crate::cache::CacheManager)
/// public surface: they are recorded, logged and turned into a miss or a
/// failed write there.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hybrid eviction weights do not sum to 1.0
    #[error("Hybrid eviction weights must sum to 1.0 (got {sum:.3})")]
    InvalidWeights { sum: f64 },

    /// Single value larger than the tier's whole budget
    #[error("Entry of {size} bytes exceeds {tier} capacity of {max} bytes")]
    EntryTooLarge { tier: String, size: u64, max: u64 },

    /// Corrupt or unreadable entry file
    #[error("Corrupt cache entry {path}: {reason}")]
    CorruptEntry { path: String, reason: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Warmup data source did not answer in time
    #[error("Warmup source '{source_name}' timed out after {timeout_ms}ms")]
    SourceTimeout { source_name: String, timeout_ms: u64 },

    /// Warmup data source failed
    #[error("Warmup source '{source_name}' failed: {reason}")]
    WarmupSource { source_name: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-friendly label used in stats and alerts
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::ConfigParse(_) | Error::Config(_) | Error::InvalidWeights { .. } => "config",
            Error::EntryTooLarge { .. } => "capacity",
            Error::CorruptEntry { .. } => "consistency",
            Error::CompressionFailed { .. } | Error::DecompressionFailed { .. } => "compression",
            Error::SourceTimeout { .. } | Error::WarmupSource { .. } => "warmup",
            Error::Internal(_) => "internal",
        }
    }
}
