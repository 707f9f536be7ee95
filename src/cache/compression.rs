//! Entry Compression
//!
//! Gzip (default) and LZ4 with automatic fallback to the uncompressed form.
//!
//! A payload is only stored compressed when it is at least
//! `min_size_bytes` long and compression shrinks it by at least
//! `min_reduction` (20% by default).
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//!
//! let data = "repeat me ".repeat(500);
//! let (stored, algorithm) = manager.compress_if_beneficial(data.as_bytes());
//! assert_eq!(algorithm, CompressionAlgorithm::Gzip);
//!
//! let restored = manager.decompress(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data.as_bytes());
//! ```

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// Gzip (deflate) - good ratio, moderate speed
    Gzip,
    /// LZ4 - fast compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Get list of available algorithms
    pub fn available_algorithms() -> Vec<Self> {
        vec![Self::None, Self::Gzip, Self::Lz4]
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Master switch
    pub enabled: bool,
    /// Algorithm used when compressing
    pub algorithm: CompressionAlgorithm,
    /// Compression level (gzip: 0-9, lz4: high-compression level)
    pub level: u32,
    /// Minimum payload size worth compressing
    pub min_size_bytes: u64,
    /// Minimum fractional size reduction to keep the compressed form
    pub min_reduction: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
            min_size_bytes: 1024, // 1KB minimum
            min_reduction: 0.20,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip compressor
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// Create with the given level (clamped to 0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::with_level(6)
    }
}

impl Compressor for GzipCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let failed = |e: std::io::Error| Error::CompressionFailed {
            algorithm: "gzip".into(),
            reason: e.to_string(),
        };
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(data).map_err(failed)?;
        encoder.finish().map_err(failed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "gzip".into(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

/// LZ4 compressor (fast compression)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create with custom compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Chooses between stored forms and owns one compressor per algorithm
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    gzip: GzipCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            gzip: GzipCompressor::with_level(config.level),
            lz4: Lz4Compressor::with_level(config.level as i32),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Gzip => &self.gzip,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress with the configured algorithm when it pays off
    ///
    /// Returns (stored_bytes, algorithm_used). Small payloads, payloads that
    /// shrink by less than `min_reduction`, and compression failures all come
    /// back uncompressed.
    pub fn compress_if_beneficial(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        let algorithm = self.config.algorithm;
        if !self.config.enabled
            || algorithm == CompressionAlgorithm::None
            || (data.len() as u64) < self.config.min_size_bytes
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(algorithm).compress(data) {
            Ok(compressed) => {
                let max_len = data.len() as f64 * (1.0 - self.config.min_reduction);
                if (compressed.len() as f64) <= max_len {
                    (Bytes::from(compressed), algorithm)
                } else {
                    (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
                }
            }
            Err(e) => {
                tracing::warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"<div class=\"profile\">acme</div>"
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn test_gzip_roundtrip() {
        let compressor = GzipCompressor::default();
        let data = repetitive(4096);

        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::default();
        let data = repetitive(4096);

        let compressed = compressor.compress(&data).unwrap();
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_small_payload_left_alone() {
        let manager = CompressionManager::new();
        let (stored, algorithm) = manager.compress_if_beneficial(&repetitive(512));
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.len(), 512);
    }

    #[test]
    fn test_compressible_payload_compressed() {
        let manager = CompressionManager::new();
        let data = repetitive(8192);
        let (stored, algorithm) = manager.compress_if_beneficial(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Gzip);
        assert!(stored.len() < data.len());
    }

    #[test]
    fn test_incompressible_payload_kept_raw() {
        let manager = CompressionManager::new();
        // xorshift noise does not compress by 20%
        let mut state = 0x2545F4914F6CDD1Du64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let (stored, algorithm) = manager.compress_if_beneficial(&noise);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), noise.as_slice());
    }

    #[test]
    fn test_disabled_compression() {
        let manager = CompressionManager::with_config(CompressionConfig {
            enabled: false,
            ..Default::default()
        });
        let (_, algorithm) = manager.compress_if_beneficial(&repetitive(8192));
        assert_eq!(algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn test_lz4_configured() {
        let manager = CompressionManager::with_config(CompressionConfig {
            algorithm: CompressionAlgorithm::Lz4,
            level: 4,
            ..Default::default()
        });
        let data = repetitive(8192);
        let (stored, algorithm) = manager.compress_if_beneficial(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(manager.decompress(&stored, algorithm).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_corrupt_gzip_reports_error() {
        let manager = CompressionManager::new();
        let err = manager
            .decompress(b"definitely not gzip", CompressionAlgorithm::Gzip)
            .unwrap_err();
        assert_eq!(err.kind(), "compression");
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Gzip.to_string(), "gzip");
        assert_eq!(CompressionAlgorithm::available_algorithms().len(), 3);
    }
}
