//! Prompt result cache
//!
//! Size- and count-bounded LRU with TTL over fully completed generation
//! responses. Keys are SHA-256 fingerprints of the canonical request
//! parameters, so key order in the incoming request never changes the
//! fingerprint. Oversized responses (> 10 MiB serialized) are skipped.
//!
//! Optional JSON persistence is written atomically (temp file + rename
//! in the parent directory) and reloaded on startup, dropping entries
//! whose TTL has passed in the meantime.
//!
//! The token estimator is a whitespace word count over the response
//! text and returns 0 when no text is present, so the byte bound is
//! the effective eviction guard in practice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::Result;

/// Responses serialized above this size are not cached
const MAX_ENTRY_BYTES: u64 = 10 * 1024 * 1024;

/// Canonical cache key inputs
#[derive(Debug, Clone, Serialize)]
pub struct PromptKey<'a> {
    pub model_id: &'a str,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl PromptKey<'_> {
    /// SHA-256 hex fingerprint over the canonical JSON encoding. Field
    /// order is fixed by the struct, making the fingerprint
    /// deterministic regardless of how the caller assembled its input.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct PromptCacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_total_tokens: u64,
    pub max_total_bytes: u64,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Optional JSON persistence file
    pub persist_path: Option<PathBuf>,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1024,
            max_total_tokens: 1024 * 1024,
            max_total_bytes: 256 * 1024 * 1024,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry {
    value: Value,
    tokens: u64,
    bytes: u64,
    expires_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedCache {
    entries: HashMap<String, CachedEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptCacheStats {
    pub entries: usize,
    pub total_tokens: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub skipped_oversize: u64,
}

struct CacheState {
    entries: HashMap<String, CachedEntry>,
    total_tokens: u64,
    total_bytes: u64,
}

pub struct PromptResultCache {
    config: PromptCacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    skipped_oversize: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PromptResultCache {
    pub fn new(config: PromptCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_tokens: 0,
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            skipped_oversize: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load persisted entries (if configured) and start the TTL sweep.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if self.config.persist_path.is_some() {
            self.load().await;
        }

        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "Prompt cache TTL sweep");
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Lookup: expired entries count as misses and are removed; hits
    /// move to the MRU position.
    pub async fn get(&self, key: &PromptKey<'_>) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let fingerprint = key.fingerprint();
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(&fingerprint) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.expires_at <= Utc::now(),
        };

        if expired {
            Self::remove_entry(&mut state, &fingerprint);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let entry = state.entries.get_mut(&fingerprint)?;
        entry.last_used = Utc::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert a completed response, evicting LRU entries until the
    /// count, token and byte bounds all hold.
    pub async fn set(&self, key: &PromptKey<'_>, value: Value) {
        if !self.config.enabled {
            return;
        }
        let bytes = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        if bytes > MAX_ENTRY_BYTES {
            self.skipped_oversize.fetch_add(1, Ordering::Relaxed);
            debug!(bytes, "Response too large for prompt cache, skipping");
            return;
        }
        let tokens = estimate_tokens(&value);
        let fingerprint = key.fingerprint();

        let mut state = self.state.lock().await;
        // Replacing an entry releases its accounting first
        Self::remove_entry(&mut state, &fingerprint);

        while !state.entries.is_empty()
            && (state.entries.len() >= self.config.max_entries
                || state.total_tokens + tokens > self.config.max_total_tokens
                || state.total_bytes + bytes > self.config.max_total_bytes)
        {
            let lru = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match lru {
                Some(lru_key) => {
                    Self::remove_entry(&mut state, &lru_key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        let now = Utc::now();
        state.entries.insert(
            fingerprint,
            CachedEntry {
                value,
                tokens,
                bytes,
                expires_at: now
                    + chrono::Duration::from_std(self.config.ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
                last_used: now,
            },
        );
        state.total_tokens += tokens;
        state.total_bytes += bytes;
    }

    fn remove_entry(state: &mut CacheState, key: &str) {
        if let Some(entry) = state.entries.remove(key) {
            state.total_tokens = state.total_tokens.saturating_sub(entry.tokens);
            state.total_bytes = state.total_bytes.saturating_sub(entry.bytes);
        }
    }

    async fn sweep_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            Self::remove_entry(&mut state, &key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub async fn stats(&self) -> PromptCacheStats {
        let state = self.state.lock().await;
        PromptCacheStats {
            entries: state.entries.len(),
            total_tokens: state.total_tokens,
            total_bytes: state.total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            skipped_oversize: self.skipped_oversize.load(Ordering::Relaxed),
        }
    }

    /// Persist current entries atomically.
    pub async fn save(&self) {
        let Some(path) = &self.config.persist_path else { return };
        let snapshot = {
            let state = self.state.lock().await;
            PersistedCache {
                entries: state.entries.clone(),
            }
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize prompt cache");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            warn!(error = %e, "Failed to write prompt cache");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(error = %e, "Failed to publish prompt cache");
        }
    }

    async fn load(&self) {
        let Some(path) = &self.config.persist_path else { return };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let persisted: PersistedCache = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Corrupt prompt cache file, ignoring");
                return;
            }
        };

        let now = Utc::now();
        let mut state = self.state.lock().await;
        for (key, entry) in persisted.entries {
            if entry.expires_at > now {
                state.total_tokens += entry.tokens;
                state.total_bytes += entry.bytes;
                state.entries.insert(key, entry);
            }
        }
        info!(entries = state.entries.len(), "Prompt cache loaded from disk");
    }

    /// Idempotent shutdown: stop the sweep and persist.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.save().await;
    }
}

/// Whitespace word count over the response text; 0 when the response
/// carries no text field.
fn estimate_tokens(value: &Value) -> u64 {
    value
        .get("text")
        .and_then(Value::as_str)
        .map(|text| text.split_whitespace().count() as u64)
        .unwrap_or(0)
}
