//! Model artifact cache
//!
//! Content-addressed, size-bounded on-disk store for model artifacts
//! (weights, tokenizer, config). Layout:
//!
//! ```text
//! <root>/index.json                  entries, stats, bookkeeping
//! <root>/artifacts/<hash>/           one immutable directory per entry
//!     model files...
//!     metadata.json
//! ```
//!
//! The cache key is `<id>:<revision|"main">:<quant|"none">:<modality|"text">@<hash>`
//! where `<hash>` is the first 16 hex chars of SHA-256 over the
//! colon-joined components. The truncated hash names the directory; the
//! full key is the identity inside the index.
//!
//! Index writes are coalesced behind a dirty flag. A corrupt index file
//! is replaced with an empty one; cache failures are never fatal to
//! the load they were asked to speed up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{GantryError, Result};

const INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";
const ARTIFACTS_DIR: &str = "artifacts";
const METADATA_FILE: &str = "metadata.json";

/// Eviction target as a fraction of the size limit
const EVICTION_TARGET: f64 = 0.8;

/// Health reports near-limit above this fraction of the size limit
const NEAR_LIMIT: f64 = 0.9;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ArtifactCacheConfig {
    pub enabled: bool,
    /// Cache root directory
    pub root: PathBuf,
    /// Maximum total artifact bytes
    pub max_size_bytes: u64,
    /// Drop entries older than this many days at validation (0 = off)
    pub max_age_days: u32,
    /// Validate index entries against disk when the cache starts
    pub validate_on_startup: bool,
    /// Delay for coalesced index writes
    pub index_write_delay: Duration,
}

impl Default for ArtifactCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(".gantry-cache"),
            max_size_bytes: 50 * 1024 * 1024 * 1024,
            max_age_days: 0,
            validate_on_startup: true,
            index_write_delay: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// The variant identity an artifact is cached under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub model_id: String,
    pub revision: Option<String>,
    pub quantization: Option<String>,
    pub modality: Option<String>,
}

impl ArtifactKey {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            revision: None,
            quantization: None,
            modality: None,
        }
    }

    /// Full cache key and the 16-hex-char directory hash
    pub fn derive(&self) -> (String, String) {
        let joined = format!(
            "{}:{}:{}:{}",
            self.model_id,
            self.revision.as_deref().unwrap_or("main"),
            self.quantization.as_deref().unwrap_or("none"),
            self.modality.as_deref().unwrap_or("text"),
        );
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let hash = digest[..16].to_string();
        (format!("{joined}@{hash}"), hash)
    }
}

// ============================================================================
// Index
// ============================================================================

/// One cached artifact directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub key: String,
    pub hash: String,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_size_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

impl IndexStats {
    fn update_hit_rate(&mut self) {
        let total = self.cache_hits + self.cache_misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        };
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    created: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    entries: HashMap<String, ArtifactEntry>,
    stats: IndexStats,
}

impl CacheIndex {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: INDEX_VERSION,
            created: now,
            last_updated: now,
            entries: HashMap::new(),
            stats: IndexStats::default(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub hit: bool,
    pub entry: Option<ArtifactEntry>,
    pub artifact_path: Option<PathBuf>,
    pub lookup_time_ms: f64,
}

impl LookupOutcome {
    fn miss(started: Instant) -> Self {
        Self {
            hit: false,
            entry: None,
            artifact_path: None,
            lookup_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

/// Snapshot for health reporting
#[derive(Debug, Clone)]
pub struct CacheHealth {
    pub healthy: bool,
    pub size_bytes: u64,
    pub entry_count: usize,
    pub hit_rate: f64,
    pub near_limit: bool,
    pub corrupted_entries: u64,
}

// ============================================================================
// Cache
// ============================================================================

pub struct ArtifactCache {
    config: ArtifactCacheConfig,
    index: RwLock<CacheIndex>,
    dirty: AtomicBool,
    write_scheduled: AtomicBool,
    corrupted_entries: AtomicU64,
}

impl ArtifactCache {
    /// Open (or initialise) the cache at the configured root.
    pub async fn open(config: ArtifactCacheConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(config.root.join(ARTIFACTS_DIR)).await?;

        let index = Self::load_index(&config.root).await;
        info!(
            root = %config.root.display(),
            entries = index.entries.len(),
            size_bytes = index.stats.total_size_bytes,
            "Artifact cache opened"
        );

        let cache = Arc::new(Self {
            config,
            index: RwLock::new(index),
            dirty: AtomicBool::new(false),
            write_scheduled: AtomicBool::new(false),
            corrupted_entries: AtomicU64::new(0),
        });

        if cache.config.validate_on_startup {
            cache.validate().await;
        }

        Ok(cache)
    }

    /// A corrupt or missing index is replaced with an empty one.
    async fn load_index(root: &Path) -> CacheIndex {
        let path = root.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    warn!(error = %e, "Corrupt artifact index, starting fresh");
                    CacheIndex::empty()
                }
            },
            Err(_) => CacheIndex::empty(),
        }
    }

    fn artifact_dir(&self, hash: &str) -> PathBuf {
        self.config.root.join(ARTIFACTS_DIR).join(hash)
    }

    /// Look up an artifact by variant key.
    ///
    /// A hit whose directory has vanished is treated as corruption:
    /// the entry is dropped and the lookup counts as a miss.
    pub async fn lookup(self: &Arc<Self>, key: &ArtifactKey) -> LookupOutcome {
        let started = Instant::now();
        if !self.config.enabled {
            return LookupOutcome::miss(started);
        }

        let (full_key, hash) = key.derive();
        let dir = self.artifact_dir(&hash);

        let mut index = self.index.write().await;

        if !index.entries.contains_key(&full_key) {
            index.stats.cache_misses += 1;
            index.stats.update_hit_rate();
            drop(index);
            self.mark_dirty();
            return LookupOutcome::miss(started);
        }

        let dir_ok = matches!(tokio::fs::metadata(&dir).await, Ok(m) if m.is_dir());
        if !dir_ok {
            if let Some(removed) = index.entries.remove(&full_key) {
                index.stats.total_size_bytes =
                    index.stats.total_size_bytes.saturating_sub(removed.size_bytes);
                self.corrupted_entries.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, "Artifact directory missing, dropped index entry");
            }
            index.stats.cache_misses += 1;
            index.stats.update_hit_rate();
            drop(index);
            self.mark_dirty();
            return LookupOutcome::miss(started);
        }

        let Some(entry) = index.entries.get_mut(&full_key) else {
            // Unreachable given the contains_key check above
            return LookupOutcome::miss(started);
        };
        entry.last_accessed = Utc::now();
        entry.access_count += 1;
        let entry = entry.clone();
        index.stats.cache_hits += 1;
        index.stats.update_hit_rate();
        drop(index);
        self.mark_dirty();

        debug!(key = %full_key, "Artifact cache hit");
        LookupOutcome {
            hit: true,
            entry: Some(entry),
            artifact_path: Some(dir),
            lookup_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Store artifacts for a variant by copying every regular file from
    /// `source` (directories are not descended into). Returns the
    /// existing entry when the variant is already cached.
    pub async fn store(
        self: &Arc<Self>,
        key: &ArtifactKey,
        source: &Path,
        metadata: Value,
    ) -> Result<ArtifactEntry> {
        if !self.config.enabled {
            return Err(GantryError::Internal("artifact cache disabled".to_string()));
        }

        let (full_key, hash) = key.derive();

        {
            let index = self.index.read().await;
            if let Some(existing) = index.entries.get(&full_key) {
                return Ok(existing.clone());
            }
        }

        // Stage into a temp directory, then rename into place so lookups
        // never observe a half-copied artifact.
        let final_dir = self.artifact_dir(&hash);
        let staging = self
            .config
            .root
            .join(ARTIFACTS_DIR)
            .join(format!(".staging-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;

        let copy_result = self.copy_regular_files(source, &staging, &metadata).await;
        let size_bytes = match copy_result {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        match tokio::fs::rename(&staging, &final_dir).await {
            Ok(()) => {}
            Err(_) if matches!(tokio::fs::metadata(&final_dir).await, Ok(m) if m.is_dir()) => {
                // A concurrent store won the rename; ours is redundant.
                let _ = tokio::fs::remove_dir_all(&staging).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(GantryError::Io(e));
            }
        }

        let entry = ArtifactEntry {
            key: full_key.clone(),
            hash,
            created: Utc::now(),
            last_accessed: Utc::now(),
            access_count: 0,
            size_bytes,
            metadata,
        };

        {
            let mut index = self.index.write().await;
            if let Some(previous) = index.entries.insert(full_key.clone(), entry.clone()) {
                index.stats.total_size_bytes =
                    index.stats.total_size_bytes.saturating_sub(previous.size_bytes);
            }
            index.stats.total_size_bytes += size_bytes;
        }
        self.save_index().await;

        info!(key = %full_key, size_bytes, "Stored model artifacts");
        self.evict_if_needed().await;

        Ok(entry)
    }

    async fn copy_regular_files(
        &self,
        source: &Path,
        dest: &Path,
        metadata: &Value,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut dir = tokio::fs::read_dir(source).await?;
        while let Some(item) = dir.next_entry().await? {
            let file_type = item.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let target = dest.join(item.file_name());
            total += tokio::fs::copy(item.path(), target).await?;
        }

        let metadata_bytes = serde_json::to_vec_pretty(metadata)?;
        total += metadata_bytes.len() as u64;
        tokio::fs::write(dest.join(METADATA_FILE), metadata_bytes).await?;

        Ok(total)
    }

    /// Evict LRU entries until the cache is at or below 80% of its
    /// size limit. No-op while under the limit.
    pub async fn evict_if_needed(self: &Arc<Self>) {
        let target = (self.config.max_size_bytes as f64 * EVICTION_TARGET) as u64;
        let mut removed_dirs: Vec<PathBuf> = Vec::new();

        {
            let mut index = self.index.write().await;
            if index.stats.total_size_bytes <= self.config.max_size_bytes {
                return;
            }

            while index.stats.total_size_bytes > target {
                let lru_key = index
                    .entries
                    .values()
                    .min_by_key(|e| e.last_accessed)
                    .map(|e| e.key.clone());
                let Some(lru_key) = lru_key else { break };
                if let Some(entry) = index.entries.remove(&lru_key) {
                    index.stats.total_size_bytes =
                        index.stats.total_size_bytes.saturating_sub(entry.size_bytes);
                    index.stats.evictions += 1;
                    removed_dirs.push(self.artifact_dir(&entry.hash));
                    info!(key = %lru_key, size_bytes = entry.size_bytes, "Evicted artifact (LRU)");
                }
            }
        }

        for dir in removed_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Failed to remove evicted artifact dir");
            }
        }
        self.save_index().await;
    }

    /// Drop index entries whose directory is missing, and (when
    /// configured) entries past the age limit.
    pub async fn validate(self: &Arc<Self>) {
        let max_age = (self.config.max_age_days > 0)
            .then(|| chrono::Duration::days(self.config.max_age_days as i64));

        let mut dropped = 0usize;
        let mut removed_dirs: Vec<PathBuf> = Vec::new();
        {
            let mut index = self.index.write().await;
            let keys: Vec<String> = index.entries.keys().cloned().collect();
            for key in keys {
                let Some(entry) = index.entries.get(&key) else { continue };
                let dir = self.artifact_dir(&entry.hash);
                let dir_ok = matches!(tokio::fs::metadata(&dir).await, Ok(m) if m.is_dir());
                let expired = max_age
                    .map(|limit| Utc::now() - entry.created > limit)
                    .unwrap_or(false);
                if !dir_ok || expired {
                    if let Some(removed) = index.entries.remove(&key) {
                        index.stats.total_size_bytes = index
                            .stats
                            .total_size_bytes
                            .saturating_sub(removed.size_bytes);
                        if dir_ok {
                            removed_dirs.push(dir);
                        } else {
                            self.corrupted_entries.fetch_add(1, Ordering::Relaxed);
                        }
                        dropped += 1;
                    }
                }
            }
        }

        for dir in removed_dirs {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }

        if dropped > 0 {
            info!(dropped, "Artifact cache validation dropped entries");
            self.save_index().await;
        }
    }

    /// Remove one entry and its directory.
    pub async fn remove(self: &Arc<Self>, key: &ArtifactKey) -> bool {
        let (full_key, _) = key.derive();
        let removed = {
            let mut index = self.index.write().await;
            index.entries.remove(&full_key).map(|entry| {
                index.stats.total_size_bytes =
                    index.stats.total_size_bytes.saturating_sub(entry.size_bytes);
                entry
            })
        };
        match removed {
            Some(entry) => {
                let _ = tokio::fs::remove_dir_all(self.artifact_dir(&entry.hash)).await;
                self.save_index().await;
                true
            }
            None => false,
        }
    }

    /// Remove everything.
    pub async fn clear(self: &Arc<Self>) {
        let dirs: Vec<PathBuf> = {
            let mut index = self.index.write().await;
            let dirs = index
                .entries
                .values()
                .map(|e| self.artifact_dir(&e.hash))
                .collect();
            index.entries.clear();
            index.stats.total_size_bytes = 0;
            dirs
        };
        for dir in dirs {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        self.save_index().await;
        info!("Artifact cache cleared");
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.read().await.stats.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn health(&self) -> CacheHealth {
        let index = self.index.read().await;
        let size = index.stats.total_size_bytes;
        CacheHealth {
            healthy: true,
            size_bytes: size,
            entry_count: index.entries.len(),
            hit_rate: index.stats.hit_rate,
            near_limit: size as f64 >= self.config.max_size_bytes as f64 * NEAR_LIMIT,
            corrupted_entries: self.corrupted_entries.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Index persistence
    // ========================================================================

    fn mark_dirty(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::Release);
        self.schedule_index_write();
    }

    /// Coalesce bursts of index mutations into one delayed write.
    fn schedule_index_write(self: &Arc<Self>) {
        if self.write_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(cache.config.index_write_delay).await;
            cache.write_scheduled.store(false, Ordering::Release);
            if cache.dirty.swap(false, Ordering::AcqRel) {
                cache.save_index().await;
            }
        });
    }

    /// Write the index atomically (temp file + rename).
    async fn save_index(&self) {
        let bytes = {
            let mut index = self.index.write().await;
            index.last_updated = Utc::now();
            match serde_json::to_vec_pretty(&*index) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize artifact index");
                    return;
                }
            }
        };

        let path = self.config.root.join(INDEX_FILE);
        let tmp = self.config.root.join(format!("{INDEX_FILE}.tmp"));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            warn!(error = %e, "Failed to write artifact index");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            warn!(error = %e, "Failed to publish artifact index");
        }
        self.dirty.store(false, Ordering::Release);
    }

    /// Flush any coalesced index write immediately (shutdown path).
    pub async fn flush(&self) {
        if self.dirty.load(Ordering::Acquire) {
            self.save_index().await;
        }
    }
}
