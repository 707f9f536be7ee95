//! L2 Cache - File-Backed Warm Tier
//!
//! Durable, larger-capacity tier and the source of truth for writes.
//!
//! # Layout
//!
//! ```text
//! <base_dir>/
//!   index.json                         full key -> metadata (debounced)
//!   profiles_acme.com_3f2a...e1.cache  one file per entry
//! ```
//!
//! Each entry file is `[u32 BE header length][header JSON][payload]`. The
//! header repeats the key and the bookkeeping needed to rebuild a lost index
//! record, so [`FileCache::repair_index`] can reconcile the index against
//! the directory.
//!
//! # Consistency
//!
//! Every mutation of the index or the byte total happens while holding the
//! tier's write lock, across the whole read-check-evict-write sequence.
//! Entry files are written before `set` returns; the index itself is
//! persisted by a [`DebouncedFlush`] and may lag by up to
//! `index_flush_delay_ms` (see [`FileCache::unpersisted_mutations`]).

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::entry::{duration_ms, now_ms, stable_hash, EntryMetadata, KeyFilter, DEFAULT_PRIORITY};
use super::flush::{DebouncedFlush, FlushTarget};
use super::policy::{EvictionCandidate, EvictionPolicy, EvictionStrategy, EvictionTarget, TierUsage};
use super::stats::{Tier, TierCounters, TierStats};
use super::warmer::{RecentEntry, RecentEntrySource};
use crate::error::{Error, Result};

/// Index file name inside the base directory
pub const INDEX_FILE: &str = "index.json";

/// Entry file extension
pub const ENTRY_EXTENSION: &str = "cache";

/// Suffix of in-flight entry writes
const TMP_SUFFIX: &str = ".tmp";

const KEY_FRAGMENT_LEN: usize = 40;

/// L2 Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    /// Directory holding the index and entry files
    pub base_dir: PathBuf,
    /// Byte budget in MB
    pub max_size_mb: f64,
    /// TTL applied when the caller gives none
    pub default_ttl_ms: u64,
    /// Strategy used under capacity pressure
    pub eviction_policy: EvictionStrategy,
    /// Fraction of the budget to free down to under pressure
    pub eviction_target: f64,
    pub compression: CompressionConfig,
    /// Quiet period before the index is persisted
    pub index_flush_delay_ms: u64,
    /// Reconcile index and directory during `init`
    pub repair_on_startup: bool,
    /// Keys per concurrent chunk in batch operations
    pub batch_concurrency: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./cache/l2"),
            max_size_mb: 1024.0,
            default_ttl_ms: 24 * 60 * 60 * 1000,
            eviction_policy: EvictionStrategy::Lru,
            eviction_target: 0.90,
            compression: CompressionConfig::default(),
            index_flush_delay_ms: 5000,
            repair_on_startup: true,
            batch_concurrency: 10,
        }
    }
}

impl FileCacheConfig {
    pub fn max_bytes(&self) -> u64 {
        (self.max_size_mb.max(0.0) * 1024.0 * 1024.0) as u64
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn index_flush_delay(&self) -> Duration {
        Duration::from_millis(self.index_flush_delay_ms)
    }
}

/// On-disk file name for a key: sanitized fragment plus stable hash
pub fn file_name_for(key: &str) -> String {
    let fragment: String = key
        .chars()
        .take(KEY_FRAGMENT_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}_{:016x}.{}",
        fragment,
        stable_hash(key.as_bytes()),
        ENTRY_EXTENSION
    )
}

// =============================================================================
// Entry File Format
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryHeader {
    key: String,
    algorithm: CompressionAlgorithm,
    priority: u8,
    created_at: i64,
    ttl_absolute: Option<i64>,
}

fn encode_entry(header: &EntryHeader, payload: &[u8]) -> Result<Bytes> {
    let header = serde_json::to_vec(header)?;
    let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write to a sibling temp file and rename it over `path`
///
/// Readers see either the previous file or the complete new one.
async fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn decode_entry(path: &Path, data: Bytes) -> Result<(EntryHeader, Bytes)> {
    let corrupt = |reason: &str| Error::CorruptEntry {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let mut data = data;
    if data.len() < 4 {
        return Err(corrupt("truncated header length"));
    }
    let header_len = data.get_u32() as usize;
    if data.len() < header_len {
        return Err(corrupt("truncated header"));
    }
    let header_bytes = data.split_to(header_len);
    let header: EntryHeader =
        serde_json::from_slice(&header_bytes).map_err(|e| corrupt(&e.to_string()))?;
    Ok((header, data))
}

// =============================================================================
// Index
// =============================================================================

/// Index record for one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub file_name: String,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
}

impl IndexRecord {
    /// Both records describe the same write of the entry
    fn is_same_write(&self, other: &IndexRecord) -> bool {
        self.file_name == other.file_name
            && self.metadata.created_at == other.metadata.created_at
            && self.metadata.size_bytes == other.metadata.size_bytes
            && self.metadata.ttl_absolute == other.metadata.ttl_absolute
    }
}

#[derive(Debug, Default)]
struct IndexState {
    records: HashMap<String, IndexRecord>,
    /// Access order, not persisted
    sequences: HashMap<String, u64>,
    used_bytes: u64,
    sequence: u64,
}

impl IndexState {
    fn touch(&mut self, key: &str) {
        self.sequence += 1;
        self.sequences.insert(key.to_string(), self.sequence);
    }

    fn insert(&mut self, key: String, record: IndexRecord) {
        self.used_bytes += record.metadata.size_bytes;
        self.touch(&key);
        if let Some(old) = self.records.insert(key, record) {
            self.used_bytes = self.used_bytes.saturating_sub(old.metadata.size_bytes);
        }
    }

    fn remove(&mut self, key: &str) -> Option<IndexRecord> {
        let record = self.records.remove(key)?;
        self.sequences.remove(key);
        self.used_bytes = self.used_bytes.saturating_sub(record.metadata.size_bytes);
        Some(record)
    }

    fn replace_all(&mut self, records: HashMap<String, IndexRecord>) {
        self.records.clear();
        self.sequences.clear();
        self.used_bytes = 0;
        let mut ordered: Vec<(String, IndexRecord)> = records.into_iter().collect();
        ordered.sort_by_key(|(_, r)| r.metadata.last_accessed);
        for (key, record) in ordered {
            self.insert(key, record);
        }
    }

    fn candidates(&self, filter: &KeyFilter) -> Vec<EvictionCandidate> {
        self.records
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(key, record)| {
                let sequence = self.sequences.get(key).copied().unwrap_or(0);
                EvictionCandidate::from_metadata(key.as_str(), &record.metadata, sequence)
            })
            .collect()
    }
}

/// Index plus its persistence target
struct IndexStore {
    path: PathBuf,
    state: RwLock<IndexState>,
}

#[async_trait]
impl FlushTarget for IndexStore {
    async fn flush(&self) -> Result<()> {
        let bytes = {
            let state = self.state.read();
            serde_json::to_vec(&state.records)?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(category = "cache.l2", "Index persisted ({} bytes)", bytes.len());
        Ok(())
    }
}

/// Outcome of [`FileCache::repair_index`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Entry files found on disk
    pub scanned: usize,
    /// Index records rebuilt from entry files
    pub recovered: usize,
    /// Index records whose file was missing
    pub stale_records: usize,
    /// Files deleted because no key maps to them (or they already expired)
    pub orphans_removed: usize,
}

impl RepairReport {
    pub fn changes(&self) -> usize {
        self.recovered + self.stale_records + self.orphans_removed
    }
}

// =============================================================================
// File Cache
// =============================================================================

/// L2 Cache - file-backed warm tier
pub struct FileCache {
    config: FileCacheConfig,
    max_bytes: u64,
    policy: EvictionPolicy,
    compression: CompressionManager,
    index: Arc<IndexStore>,
    /// Serializes index/size mutations (held across awaits)
    write_lock: tokio::sync::Mutex<()>,
    flusher: OnceLock<DebouncedFlush>,
    counters: TierCounters,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("base_dir", &self.config.base_dir)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl FileCache {
    /// Create the tier; call [`FileCache::init`] before use
    pub fn new(config: FileCacheConfig) -> Self {
        Self::with_policy(config, EvictionPolicy::default())
    }

    pub fn with_policy(config: FileCacheConfig, policy: EvictionPolicy) -> Self {
        let index = Arc::new(IndexStore {
            path: config.base_dir.join(INDEX_FILE),
            state: RwLock::new(IndexState::default()),
        });
        Self {
            max_bytes: config.max_bytes(),
            compression: CompressionManager::with_config(config.compression.clone()),
            config,
            policy,
            index,
            write_lock: tokio::sync::Mutex::new(()),
            flusher: OnceLock::new(),
            counters: TierCounters::new(),
        }
    }

    pub fn config(&self) -> &FileCacheConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    fn entry_path(&self, file_name: &str) -> PathBuf {
        self.config.base_dir.join(file_name)
    }

    fn mark_dirty(&self) {
        if let Some(flusher) = self.flusher.get() {
            flusher.arm();
        }
    }

    /// Ensure the directory exists, load the index and start persistence
    ///
    /// A missing index is an empty one. An unreadable index is discarded and
    /// rebuilt from the entry files.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.base_dir).await?;

        let mut needs_repair = self.config.repair_on_startup;
        match tokio::fs::read(&self.index.path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, IndexRecord>>(&bytes) {
                Ok(records) => self.index.state.write().replace_all(records),
                Err(e) => {
                    warn!(
                        category = "cache.l2",
                        "Index {} unreadable, rebuilding: {}",
                        self.index.path.display(),
                        e
                    );
                    self.index.state.write().replace_all(HashMap::new());
                    needs_repair = true;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(category = "cache.l2", "No index yet, starting empty");
            }
            Err(e) => return Err(e.into()),
        }

        let target: Arc<dyn FlushTarget> = self.index.clone();
        self.flusher
            .get_or_init(|| DebouncedFlush::spawn(target, self.config.index_flush_delay()));

        if needs_repair {
            let report = self.repair_index().await?;
            if report.changes() > 0 {
                info!(
                    category = "cache.l2",
                    "Startup repair: {} recovered, {} stale, {} orphans removed",
                    report.recovered,
                    report.stale_records,
                    report.orphans_removed
                );
            }
        }

        let (entries, used) = {
            let state = self.index.state.read();
            (state.records.len(), state.used_bytes)
        };
        info!(
            category = "cache.l2",
            "File cache ready at {}: {} entries, {} bytes",
            self.config.base_dir.display(),
            entries,
            used
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Get a value
    ///
    /// Existence and expiry come from the index alone. Read failures are
    /// logged and reported as a miss.
    pub async fn get(&self, key: &str, allow_stale: bool) -> Option<Value> {
        let now = now_ms();
        let record = self.index.state.read().records.get(key).cloned();
        let Some(record) = record else {
            self.counters.record_miss();
            return None;
        };

        if record.metadata.is_expired_at(now) && !allow_stale {
            match self.remove_if_current(key, &record).await {
                Ok(true) => self.counters.record_expired(1),
                Ok(false) => {}
                Err(e) => warn!(category = "cache.l2", "Failed to drop expired {}: {}", key, e),
            }
            self.counters.record_miss();
            return None;
        }

        match self.read_value(key, &record).await {
            Ok(value) => {
                {
                    let mut state = self.index.state.write();
                    if let Some(r) = state.records.get_mut(key) {
                        r.metadata.record_access(now);
                        state.touch(key);
                    }
                }
                self.mark_dirty();
                self.counters.record_hit();
                Some(value)
            }
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!(category = "cache.l2", "Entry file for {} missing, dropping record", key);
                if let Err(e) = self.remove_if_current(key, &record).await {
                    warn!(category = "cache.l2", "Failed to drop {}: {}", key, e);
                }
                self.counters.record_miss();
                None
            }
            Err(e @ Error::Io(_)) => {
                warn!(category = "cache.l2", "Read of {} failed: {}", key, e);
                self.counters.record_error();
                self.counters.record_miss();
                None
            }
            Err(e) => {
                warn!(category = "cache.l2", "Dropping unreadable entry {}: {}", key, e);
                self.counters.record_error();
                if let Err(e) = self.remove_if_current(key, &record).await {
                    warn!(category = "cache.l2", "Failed to drop {}: {}", key, e);
                }
                self.counters.record_miss();
                None
            }
        }
    }

    async fn read_value(&self, key: &str, record: &IndexRecord) -> Result<Value> {
        let path = self.entry_path(&record.file_name);
        let data = Bytes::from(tokio::fs::read(&path).await?);
        let (header, payload) = decode_entry(&path, data)?;
        if header.key != key {
            return Err(Error::CorruptEntry {
                path: path.display().to_string(),
                reason: format!("holds key '{}'", header.key),
            });
        }
        let raw = self.compression.decompress(&payload, header.algorithm)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Live entry present? (index only)
    pub fn exists(&self, key: &str) -> bool {
        let now = now_ms();
        self.index
            .state
            .read()
            .records
            .get(key)
            .map_or(false, |r| !r.metadata.is_expired_at(now))
    }

    /// Batch get in chunks of `batch_concurrency`
    pub async fn get_multiple(&self, keys: &[String], allow_stale: bool) -> HashMap<String, Value> {
        let mut found = HashMap::new();
        for chunk in keys.chunks(self.config.batch_concurrency.max(1)) {
            let results = join_all(chunk.iter().map(|key| self.get(key, allow_stale))).await;
            for (key, value) in chunk.iter().zip(results) {
                if let Some(value) = value {
                    found.insert(key.clone(), value);
                }
            }
        }
        found
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a value
    ///
    /// Returns `Ok(false)` when the value alone exceeds the budget and `Err`
    /// when it cannot be serialized or written. `None` TTL means the tier
    /// default.
    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
        priority: u8,
        compress: bool,
    ) -> Result<bool> {
        let raw = serde_json::to_vec(value)?;
        let (payload, algorithm) = if compress {
            self.compression.compress_if_beneficial(&raw)
        } else {
            (Bytes::from(raw), CompressionAlgorithm::None)
        };

        let ttl = ttl.or_else(|| Some(self.config.default_ttl()));
        let metadata = EntryMetadata::new(payload.len() as u64, ttl, priority).with_compression(algorithm);
        let size = metadata.size_bytes;
        if size > self.max_bytes {
            debug!(
                category = "cache.l2",
                "Rejected {}: {} bytes exceeds budget of {}", key, size, self.max_bytes
            );
            return Ok(false);
        }

        let file_name = file_name_for(key);
        let header = EntryHeader {
            key: key.to_string(),
            algorithm,
            priority: metadata.priority,
            created_at: metadata.created_at,
            ttl_absolute: metadata.ttl_absolute,
        };
        let encoded = encode_entry(&header, &payload)?;

        let _guard = self.write_lock.lock().await;

        let (used, previous) = {
            let state = self.index.state.read();
            let previous = state.records.get(key).map_or(0, |r| r.metadata.size_bytes);
            (state.used_bytes, previous)
        };
        if used - previous + size > self.max_bytes {
            self.make_room(key, used - previous, size).await;
        }

        let path = self.entry_path(&file_name);
        if let Err(e) = write_atomically(&path, &encoded).await {
            self.counters.record_error();
            return Err(e);
        }

        self.index
            .state
            .write()
            .insert(key.to_string(), IndexRecord { file_name, metadata });
        self.mark_dirty();
        self.counters.record_set();
        Ok(true)
    }

    /// Evict (write lock held) so `incoming` fits within the eviction target
    async fn make_room(&self, skip_key: &str, used: u64, incoming: u64) {
        let now = now_ms();
        let target = ((self.max_bytes as f64 * self.config.eviction_target) as u64)
            .min(self.max_bytes.saturating_sub(incoming));

        let candidates: Vec<EvictionCandidate> = self
            .index
            .state
            .read()
            .candidates(&KeyFilter::all())
            .into_iter()
            .filter(|c| c.key != skip_key)
            .collect();
        let plan = self
            .policy
            .plan_bytes(self.config.eviction_policy, candidates, used, target, now);

        let mut evicted = 0u64;
        for candidate in &plan {
            match self.remove_unlocked(&candidate.key).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(category = "cache.evict", "L2 evict {} failed: {}", candidate.key, e),
            }
        }
        self.counters.record_evictions(evicted);
        debug!(
            category = "cache.evict",
            "L2 evicted {} entries ({})", evicted, self.config.eviction_policy
        );
    }

    /// Drop `key` unless it was rewritten since a reader cloned `seen`
    async fn remove_if_current(&self, key: &str, seen: &IndexRecord) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .index
            .state
            .read()
            .records
            .get(key)
            .map_or(false, |r| r.is_same_write(seen));
        if !current {
            debug!(category = "cache.l2", "{} was rewritten during the read, keeping it", key);
            return Ok(false);
        }
        self.remove_unlocked(key).await
    }

    /// Drop the record and its file; caller holds the write lock
    ///
    /// The record is removed even if the file cannot be deleted; the next
    /// repair removes the leftover file.
    async fn remove_unlocked(&self, key: &str) -> Result<bool> {
        let record = self.index.state.write().remove(key);
        let Some(record) = record else {
            return Ok(false);
        };
        self.mark_dirty();

        match tokio::fs::remove_file(self.entry_path(&record.file_name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => {
                self.counters.record_error();
                Err(e.into())
            }
        }
    }

    /// Batch set in chunks of `batch_concurrency`, returns how many were stored
    pub async fn set_multiple(&self, entries: &[(String, Value, Option<Duration>)], compress: bool) -> usize {
        let mut stored = 0;
        for chunk in entries.chunks(self.config.batch_concurrency.max(1)) {
            let results = join_all(
                chunk
                    .iter()
                    .map(|(key, value, ttl)| self.set(key, value, *ttl, DEFAULT_PRIORITY, compress)),
            )
            .await;
            for ((key, _, _), result) in chunk.iter().zip(results) {
                match result {
                    Ok(true) => stored += 1,
                    Ok(false) => {}
                    Err(e) => warn!(category = "cache.l2", "Batch set of {} failed: {}", key, e),
                }
            }
        }
        stored
    }

    /// Remove an entry
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.remove_unlocked(key).await?;
        if removed {
            self.counters.record_delete();
        }
        Ok(removed)
    }

    /// Remove every entry passing the filter
    pub async fn clear(&self, filter: &KeyFilter) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let keys = self.keys(filter);
        let mut removed = 0;
        let mut failure = None;
        for key in &keys {
            match self.remove_unlocked(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) if removed == 0 && !keys.is_empty() => Err(e),
            _ => Ok(removed),
        }
    }

    /// Drop every expired entry
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let expired: Vec<String> = self
            .index
            .state
            .read()
            .records
            .iter()
            .filter(|(_, r)| r.metadata.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            match self.remove_unlocked(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(category = "cache.l2", "Expiry of {} failed: {}", key, e),
            }
        }
        if removed > 0 {
            self.counters.record_expired(removed as u64);
            debug!(category = "cache.l2", "Swept {} expired entries", removed);
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Repair and persistence
    // -------------------------------------------------------------------------

    /// Reconcile the index with the entry files on disk
    ///
    /// Records without a file are dropped; files without a record are
    /// re-indexed from their header (and mtime) when the header's key maps
    /// back to the file name, otherwise deleted. Running it on a consistent
    /// store changes nothing.
    pub async fn repair_index(&self) -> Result<RepairReport> {
        let _guard = self.write_lock.lock().await;
        let mut report = RepairReport::default();

        let mut on_disk = HashSet::new();
        let mut dir = tokio::fs::read_dir(&self.config.base_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.ends_with(&format!(".{}", ENTRY_EXTENSION)) {
                on_disk.insert(name);
            } else if name.ends_with(&format!(".{}{}", ENTRY_EXTENSION, TMP_SUFFIX)) {
                // interrupted write
                match tokio::fs::remove_file(item.path()).await {
                    Ok(()) => report.orphans_removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(category = "cache.l2", "Cannot remove {}: {}", name, e),
                }
            }
        }
        report.scanned = on_disk.len();

        let (stale, referenced): (Vec<String>, HashSet<String>) = {
            let state = self.index.state.read();
            let stale = state
                .records
                .iter()
                .filter(|(_, r)| !on_disk.contains(&r.file_name))
                .map(|(k, _)| k.clone())
                .collect();
            let referenced = state.records.values().map(|r| r.file_name.clone()).collect();
            (stale, referenced)
        };
        {
            let mut state = self.index.state.write();
            for key in &stale {
                state.remove(key);
            }
        }
        report.stale_records = stale.len();

        let now = now_ms();
        for name in on_disk.difference(&referenced) {
            let path = self.entry_path(name);
            match self.recover_record(&path, name, now).await {
                Ok(Some((key, record))) => {
                    self.index.state.write().insert(key, record);
                    report.recovered += 1;
                }
                Ok(None) | Err(_) => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => report.orphans_removed += 1,
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => warn!(
                            category = "cache.l2",
                            "Cannot remove orphan {}: {}",
                            path.display(),
                            e
                        ),
                    }
                }
            }
        }

        if report.changes() > 0 {
            self.mark_dirty();
            self.persist_now().await?;
        }
        debug!(category = "cache.l2", ?report, "Index repair finished");
        Ok(report)
    }

    /// Rebuild a record from an unreferenced file, `None` for orphans
    async fn recover_record(&self, path: &Path, name: &str, now: i64) -> Result<Option<(String, IndexRecord)>> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let (header, payload) = decode_entry(path, data)?;
        if file_name_for(&header.key) != name {
            return Ok(None);
        }
        if matches!(header.ttl_absolute, Some(expiry) if now > expiry) {
            return Ok(None);
        }

        let modified = tokio::fs::metadata(path).await?.modified()?;
        let last_accessed = chrono::DateTime::<chrono::Utc>::from(modified).timestamp_millis();
        let metadata = EntryMetadata {
            priority: header.priority,
            created_at: header.created_at,
            last_accessed: last_accessed.max(header.created_at),
            access_count: 0,
            ttl_absolute: header.ttl_absolute,
            size_bytes: payload.len() as u64,
            compressed: header.algorithm != CompressionAlgorithm::None,
            algorithm: header.algorithm,
        };
        Ok(Some((
            header.key,
            IndexRecord {
                file_name: name.to_string(),
                metadata,
            },
        )))
    }

    async fn persist_now(&self) -> Result<()> {
        match self.flusher.get() {
            Some(flusher) => flusher.flush_now().await,
            None => self.index.flush().await,
        }
    }

    /// Persist the index immediately
    pub async fn flush_index(&self) -> Result<()> {
        self.persist_now().await
    }

    /// Persist the index and stop the flush task
    pub async fn shutdown(&self) -> Result<()> {
        match self.flusher.get() {
            Some(flusher) => flusher.shutdown().await,
            None => self.index.flush().await,
        }
    }

    /// Index changes not yet persisted
    pub fn unpersisted_mutations(&self) -> u64 {
        self.flusher
            .get()
            .map_or(0, |flusher| flusher.unpersisted_mutations())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn keys(&self, filter: &KeyFilter) -> Vec<String> {
        self.index
            .state
            .read()
            .records
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect()
    }

    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.index
            .state
            .read()
            .records
            .get(key)
            .map(|r| r.metadata.clone())
    }

    pub fn len(&self) -> usize {
        self.index.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.index.state.read().used_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> TierStats {
        let (entries, used) = {
            let state = self.index.state.read();
            (state.records.len(), state.used_bytes)
        };
        let mut stats = self.counters.snapshot(Tier::L2, entries, used, self.max_bytes);
        stats.unpersisted_mutations = Some(self.unpersisted_mutations());
        stats
    }

    pub fn is_healthy(&self) -> bool {
        self.stats().is_healthy()
    }
}

#[async_trait]
impl EvictionTarget for FileCache {
    fn tier_name(&self) -> &'static str {
        "L2"
    }

    fn eviction_candidates(&self, filter: &KeyFilter) -> Vec<EvictionCandidate> {
        self.index.state.read().candidates(filter)
    }

    fn usage(&self) -> TierUsage {
        TierUsage {
            used_bytes: self.used_bytes(),
            max_bytes: self.max_bytes,
            hit_ratio: self.counters.hit_ratio(),
        }
    }

    async fn evict_key(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.remove_unlocked(key).await?;
        if removed {
            self.counters.record_evictions(1);
        }
        Ok(removed)
    }
}

#[async_trait]
impl RecentEntrySource for FileCache {
    /// Live entries accessed within `within`, most recent first
    async fn recent_entries(&self, within: Duration, limit: usize) -> Result<Vec<RecentEntry>> {
        let now = now_ms();
        let cutoff = now.saturating_sub(duration_ms(within));
        let mut recent: Vec<(String, IndexRecord)> = self
            .index
            .state
            .read()
            .records
            .iter()
            .filter(|(_, r)| r.metadata.last_accessed >= cutoff && !r.metadata.is_expired_at(now))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        recent.sort_by(|(_, a), (_, b)| b.metadata.last_accessed.cmp(&a.metadata.last_accessed));
        recent.truncate(limit);

        let mut entries = Vec::with_capacity(recent.len());
        for (key, record) in recent {
            match self.read_value(&key, &record).await {
                Ok(value) => entries.push(RecentEntry {
                    remaining_ttl: record.metadata.remaining_ttl(now),
                    priority: record.metadata.priority,
                    last_accessed: record.metadata.last_accessed,
                    key,
                    value,
                }),
                Err(e) => debug!(category = "cache.l2", "Skipping recent entry {}: {}", key, e),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> FileCacheConfig {
        FileCacheConfig {
            base_dir: dir.path().to_path_buf(),
            index_flush_delay_ms: 50,
            ..Default::default()
        }
    }

    async fn open(dir: &TempDir) -> FileCache {
        let cache = FileCache::new(config(dir));
        cache.init().await.unwrap();
        cache
    }

    fn blob(bytes: usize) -> Value {
        json!("x".repeat(bytes))
    }

    fn entry_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".cache"))
            .count()
    }

    #[test]
    fn test_file_name_is_stable_and_sanitized() {
        let name = file_name_for("profiles:acme.com/about us");
        assert_eq!(name, file_name_for("profiles:acme.com/about us"));
        assert!(name.starts_with("profiles_acme.com_about_us_"));
        assert!(name.ends_with(".cache"));

        let long = file_name_for(&"k".repeat(200));
        assert_eq!(long.len(), 40 + 1 + 16 + ".cache".len());
    }

    #[test]
    fn test_entry_codec() {
        let header = EntryHeader {
            key: "a:b".into(),
            algorithm: CompressionAlgorithm::Gzip,
            priority: 7,
            created_at: 1,
            ttl_absolute: None,
        };
        let encoded = encode_entry(&header, b"payload").unwrap();
        let (decoded, payload) = decode_entry(Path::new("x"), encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&payload[..], b"payload");

        let truncated = Bytes::from_static(&[0, 0, 0, 99, b'{']);
        assert!(matches!(
            decode_entry(Path::new("x"), truncated),
            Err(Error::CorruptEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_l2_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;

        assert!(cache.set("users:1", &json!({"name": "ada"}), None, 5, false).await.unwrap());
        assert!(cache.exists("users:1"));
        assert_eq!(cache.get("users:1", false).await, Some(json!({"name": "ada"})));
        assert_eq!(cache.metadata("users:1").unwrap().access_count, 1);

        assert!(cache.delete("users:1").await.unwrap());
        assert!(!cache.exists("users:1"));
        assert_eq!(cache.get("users:1", false).await, None);
        assert_eq!(entry_files(&dir), 0);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_l2_compression_applied_when_beneficial() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        let value = json!({"body": "lorem ipsum ".repeat(500)});

        cache.set("scraping:page", &value, None, 5, true).await.unwrap();
        let meta = cache.metadata("scraping:page").unwrap();
        assert!(meta.compressed);
        assert!(meta.size_bytes < serde_json::to_vec(&value).unwrap().len() as u64);
        assert_eq!(cache.get("scraping:page", false).await, Some(value));

        cache.set("scraping:tiny", &json!("ok"), None, 5, true).await.unwrap();
        assert!(!cache.metadata("scraping:tiny").unwrap().compressed);
    }

    #[tokio::test]
    async fn test_l2_expiry_and_allow_stale() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;

        cache
            .set("temp:a", &json!(1), Some(Duration::from_millis(50)), 5, false)
            .await
            .unwrap();
        cache
            .set("temp:b", &json!(2), Some(Duration::from_millis(50)), 5, false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!cache.exists("temp:a"));
        assert_eq!(cache.get("temp:a", true).await, Some(json!(1)));
        assert_eq!(cache.get("temp:a", false).await, None);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_l2_missing_file_repairs_record() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("k", &json!(1), None, 5, false).await.unwrap();

        std::fs::remove_file(dir.path().join(file_name_for("k"))).unwrap();
        assert_eq!(cache.get("k", false).await, None);
        assert!(!cache.exists("k"));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn test_l2_corrupt_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("k", &json!(1), None, 5, false).await.unwrap();

        std::fs::write(dir.path().join(file_name_for("k")), b"garbage").unwrap();
        assert_eq!(cache.get("k", false).await, None);
        assert_eq!(cache.stats().errors, 1);
        assert!(!cache.exists("k"));
    }

    #[tokio::test]
    async fn test_l2_eviction_respects_budget() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(FileCacheConfig {
            max_size_mb: 10.0 / 1024.0,
            ..config(&dir)
        });
        cache.init().await.unwrap();

        for i in 0..30 {
            assert!(cache.set(&format!("k{}", i), &blob(1000), None, 5, false).await.unwrap());
            assert!(cache.used_bytes() <= cache.max_bytes());
        }
        assert!(cache.stats().evictions > 0);
        assert!(!cache.exists("k0"));
        assert!(cache.exists("k29"));
        assert_eq!(entry_files(&dir), cache.len());
    }

    #[tokio::test]
    async fn test_l2_oversized_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(FileCacheConfig {
            max_size_mb: 1.0 / 1024.0,
            ..config(&dir)
        });
        cache.init().await.unwrap();
        assert!(!cache.set("big", &blob(4096), None, 5, false).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_l2_clear_by_namespace() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        for key in ["scraping:a", "scraping:b", "profiles:a"] {
            cache.set(key, &json!(key), None, 5, false).await.unwrap();
        }
        assert_eq!(cache.clear(&KeyFilter::namespace("scraping")).await.unwrap(), 2);
        assert_eq!(cache.keys(&KeyFilter::all()), vec!["profiles:a".to_string()]);
        assert_eq!(entry_files(&dir), 1);
    }

    #[tokio::test]
    async fn test_l2_batch_operations() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        let entries: Vec<_> = (0..25).map(|i| (format!("b:{}", i), json!(i), None)).collect();
        assert_eq!(cache.set_multiple(&entries, false).await, 25);

        let keys: Vec<String> = (0..30).map(|i| format!("b:{}", i)).collect();
        let found = cache.get_multiple(&keys, false).await;
        assert_eq!(found.len(), 25);
        assert_eq!(found["b:7"], json!(7));
    }

    #[tokio::test]
    async fn test_l2_index_persists_across_restart() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open(&dir).await;
            cache.set("profiles:acme", &json!({"lang": "en"}), None, 8, true).await.unwrap();
            cache.shutdown().await.unwrap();
            assert_eq!(cache.unpersisted_mutations(), 0);
        }
        assert!(dir.path().join(INDEX_FILE).exists());

        let reopened = open(&dir).await;
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.metadata("profiles:acme").unwrap().priority, 8);
        assert_eq!(reopened.get("profiles:acme", false).await, Some(json!({"lang": "en"})));
    }

    #[tokio::test]
    async fn test_l2_debounced_flush_tracks_pending() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("a", &json!(1), None, 5, false).await.unwrap();
        cache.set("b", &json!(2), None, 5, false).await.unwrap();
        assert!(cache.unpersisted_mutations() >= 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.unpersisted_mutations(), 0);
        let index: HashMap<String, IndexRecord> =
            serde_json::from_slice(&std::fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_repair_recovers_and_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("users:1", &json!(1), None, 6, false).await.unwrap();
        cache.set("users:2", &json!(2), None, 5, false).await.unwrap();
        cache.shutdown().await.unwrap();

        // Lose the index and drop a stray file next to the entries.
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();
        std::fs::write(dir.path().join("stray_0000000000000000.cache"), b"junk").unwrap();

        let reopened = open(&dir).await;
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.metadata("users:1").unwrap().priority, 6);
        assert_eq!(entry_files(&dir), 2);
        assert_eq!(reopened.get("users:2", false).await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        for i in 0..5 {
            cache.set(&format!("k{}", i), &json!(i), None, 5, false).await.unwrap();
        }
        std::fs::remove_file(dir.path().join(file_name_for("k3"))).unwrap();

        let first = cache.repair_index().await.unwrap();
        assert_eq!(first.stale_records, 1);
        let second = cache.repair_index().await.unwrap();
        assert_eq!(second.changes(), 0);
        assert_eq!(second.scanned, 4);
    }

    #[tokio::test]
    async fn test_recent_entries() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("a", &json!("old"), None, 5, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("b", &json!("new"), None, 5, false).await.unwrap();
        cache.get("b", false).await;

        let recent = cache.recent_entries(Duration::from_secs(3600), 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].key, "b");
        assert_eq!(recent[0].value, json!("new"));
    }

    #[tokio::test]
    async fn test_l2_stats() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("a", &json!(1), None, 5, false).await.unwrap();
        cache.get("a", false).await;
        cache.get("missing", false).await;

        let stats = cache.stats();
        assert_eq!(stats.tier, Tier::L2);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.unpersisted_mutations.is_some());
    }

    #[tokio::test]
    async fn test_stale_read_keeps_rewritten_entry() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("k", &json!("first"), None, 5, false).await.unwrap();
        let seen = cache.index.state.read().records.get("k").cloned().unwrap();

        cache.set("k", &json!("second, longer"), None, 5, false).await.unwrap();
        assert!(!cache.remove_if_current("k", &seen).await.unwrap());
        assert_eq!(cache.get("k", false).await, Some(json!("second, longer")));

        let current = cache.index.state.read().records.get("k").cloned().unwrap();
        assert!(cache.remove_if_current("k", &current).await.unwrap());
        assert!(!cache.exists("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_never_drops_fresh_write() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open(&dir).await);
        cache.set("big", &blob(1_000_000), None, 5, false).await.unwrap();

        for round in 0..30 {
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        for _ in 0..5 {
                            cache.get("big", false).await;
                        }
                    })
                })
                .collect();
            let stored = cache.set("big", &blob(1_000_000 + round), None, 5, false).await.unwrap();
            assert!(stored);
            for reader in readers {
                reader.await.unwrap();
            }
            assert!(cache.exists("big"), "lost the write of round {}", round);
        }

        assert_eq!(cache.get("big", false).await, Some(blob(1_000_029)));
        assert_eq!(cache.stats().errors, 0);
        // no temp files left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_access_order_tracks_live_keys_only() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open(&dir).await);
        for i in 0..20 {
            cache.set(&format!("k{}", i), &json!(i), None, 5, false).await.unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..20 {
                        cache.get(&format!("k{}", i), false).await;
                    }
                })
            })
            .collect();
        for i in 0..20 {
            cache.delete(&format!("k{}", i)).await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }

        let state = cache.index.state.read();
        assert!(state.records.is_empty());
        assert!(state.sequences.is_empty());
    }

    #[tokio::test]
    async fn test_repair_removes_interrupted_writes() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir).await;
        cache.set("k", &json!(1), None, 5, false).await.unwrap();

        let partial = dir.path().join(format!("{}{}", file_name_for("k"), TMP_SUFFIX));
        std::fs::write(&partial, b"half").unwrap();

        let report = cache.repair_index().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(!partial.exists());
        assert_eq!(cache.get("k", false).await, Some(json!(1)));
    }
}
