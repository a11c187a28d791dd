//! Model manager
//!
//! Load/unload orchestration with per-variant inflight deduplication,
//! an LRU of loaded handles, artifact-cache integration and draft
//! pairing. The 5-minute load budget overrides the transport's default
//! request timeout.
//!
//! Concurrency contract: for any variant key at most one `load_model`
//! RPC is in flight; concurrent callers share the leader's outcome
//! through a broadcast channel, each receiving its own error instance
//! so a shared failure never surfaces as an unobserved rejection.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    family_of, LoadOptions, ModelDescriptor, ModelHandle, ModelMetadata, ModelSource,
    ModelState, Quantization,
};
use crate::artifact::ArtifactCache;
use crate::connection::ConnectionPool;
use crate::rpc::messages::{
    methods, CheckDraftParams, DraftCompatibility, LoadModelParams, LoadModelResult,
    TokenizeParams, TokenizeResult, UnloadModelParams,
};
use crate::rpc::{RequestQueue, WorkerLink};
use crate::types::{GantryError, Result};

/// Budget for load_model RPCs, independent of the transport default
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared outcome of an inflight load; errors travel as strings so each
/// subscriber materializes its own typed error.
type InflightOutcome = std::result::Result<Arc<ModelHandle>, String>;

#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Hard cap on handles + inflight loads
    pub max_loaded_models: usize,
    /// Memory-cache LRU bound on loaded handles
    pub max_cached_models: usize,
    pub memory_cache_enabled: bool,
    pub default_context_length: u32,
    pub default_quantization: Quantization,
    pub track_stats: bool,
    /// Model ids loaded eagerly at startup
    pub warmup_on_start: Vec<String>,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            max_loaded_models: 4,
            max_cached_models: 4,
            memory_cache_enabled: true,
            default_context_length: 4096,
            default_quantization: Quantization::None,
            track_stats: true,
            warmup_on_start: Vec::new(),
        }
    }
}

/// Per-variant load statistics
#[derive(Debug, Clone, Default)]
pub struct VariantStats {
    pub loads: u64,
    pub last_load_ms: f64,
    pub artifact_hits: u64,
    pub artifact_misses: u64,
}

struct LoadedModel {
    handle: Arc<ModelHandle>,
    last_access: Instant,
}

pub struct ModelManager {
    config: ModelManagerConfig,
    pool: Arc<ConnectionPool>,
    artifacts: Option<Arc<ArtifactCache>>,
    /// Serializes load dispatches at the admission cap
    queue: RequestQueue,
    /// variant key → loaded handle (ready only)
    handles: DashMap<String, LoadedModel>,
    /// variant key → broadcast of the leader's outcome
    inflight: DashMap<String, broadcast::Sender<InflightOutcome>>,
    /// primary model id → draft model id, set by compatible check_draft
    draft_pairs: DashMap<String, String>,
    /// Retained across unloads: tiny and hot
    descriptors: DashMap<String, ModelDescriptor>,
    metadata_cache: DashMap<String, ModelMetadata>,
    stats: DashMap<String, VariantStats>,
}

impl ModelManager {
    pub fn new(
        config: ModelManagerConfig,
        pool: Arc<ConnectionPool>,
        artifacts: Option<Arc<ArtifactCache>>,
    ) -> Arc<Self> {
        let queue = RequestQueue::new(config.max_loaded_models);
        Arc::new(Self {
            config,
            pool,
            artifacts,
            queue,
            handles: DashMap::new(),
            inflight: DashMap::new(),
            draft_pairs: DashMap::new(),
            descriptors: DashMap::new(),
            metadata_cache: DashMap::new(),
            stats: DashMap::new(),
        })
    }

    /// Load a model variant, deduplicating concurrent requests.
    pub async fn load_model(self: &Arc<Self>, options: LoadOptions) -> Result<Arc<ModelHandle>> {
        let key = options.variant_key();

        // Ready handle for the identical variant: touch and return
        if let Some(mut loaded) = self.handles.get_mut(&key) {
            loaded.last_access = Instant::now();
            return Ok(Arc::clone(&loaded.handle));
        }

        // Join an inflight load or become the leader
        enum Role {
            Leader(broadcast::Sender<InflightOutcome>),
            Follower(broadcast::Receiver<InflightOutcome>),
        }
        let role = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(16);
                entry.insert(tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(message)) => Err(self.load_error(&options, message)),
                Err(_) => Err(self.load_error(&options, "load cancelled".to_string())),
            },
            Role::Leader(tx) => {
                let result = self.perform_load(&options, &key).await;
                self.inflight.remove(&key);
                let shared: InflightOutcome = match &result {
                    Ok(handle) => Ok(Arc::clone(handle)),
                    Err(e) => Err(e.to_string()),
                };
                // No receivers is the common case
                let _ = tx.send(shared);
                result
            }
        }
    }

    fn load_error(&self, options: &LoadOptions, message: String) -> GantryError {
        if options.draft {
            GantryError::Generation(message)
        } else {
            GantryError::ModelLoad(message)
        }
    }

    async fn perform_load(
        self: &Arc<Self>,
        options: &LoadOptions,
        key: &str,
    ) -> Result<Arc<ModelHandle>> {
        let started = Instant::now();

        // Pre-admission: handles and inflight loads both count, closing
        // the window where many loads race past the cap. Our own
        // inflight entry is already registered.
        if self.handles.len() + self.inflight.len() > self.config.max_loaded_models {
            return Err(self.load_error(
                options,
                format!(
                    "model limit reached ({} loaded or loading, max {})",
                    self.handles.len() + self.inflight.len() - 1,
                    self.config.max_loaded_models
                ),
            ));
        }

        // LRU eviction of loaded handles
        if self.config.memory_cache_enabled
            && self.handles.len() >= self.config.max_cached_models
        {
            if let Some(lru_key) = self.lru_variant() {
                debug!(variant = %lru_key, "Evicting LRU model");
                if let Err(e) = self.unload_variant(&lru_key).await {
                    warn!(variant = %lru_key, error = %e, "LRU unload failed");
                }
            }
        }

        // Artifact cache lookup feeds local_path
        let artifact_key = options.artifact_key(None);
        let mut local_path = options.local_path.clone();
        let mut artifact_hit = false;
        if let Some(artifacts) = &self.artifacts {
            let outcome = artifacts.lookup(&artifact_key).await;
            artifact_hit = outcome.hit;
            if let Some(path) = outcome.artifact_path {
                local_path = Some(path.to_string_lossy().to_string());
            }
        }
        if self.config.track_stats {
            let mut stats = self.stats.entry(key.to_string()).or_default();
            if artifact_hit {
                stats.artifact_hits += 1;
            } else {
                stats.artifact_misses += 1;
            }
        }

        let params = LoadModelParams {
            model_id: options.model_id.clone(),
            draft: options.draft,
            revision: options.revision.clone(),
            quantization: options
                .quantization
                .or(Some(self.config.default_quantization))
                .map(|q| q.as_str().to_string()),
            local_path: local_path.clone(),
        };

        // Dispatch through the request queue: loads are serialized at
        // the admission cap and carry their own 5-minute budget.
        let pool = Arc::clone(&self.pool);
        let raw = self
            .queue
            .execute(async move {
                let conn = pool.acquire(None).await?;
                let result = conn
                    .link
                    .request(
                        methods::LOAD_MODEL,
                        serde_json::to_value(&params)?,
                        Some(LOAD_TIMEOUT),
                    )
                    .await;
                pool.release(&conn).await;
                result
            })
            .await;

        let raw = match raw {
            Ok(value) => value,
            Err(e) => return Err(self.load_error(options, e.to_string())),
        };
        let loaded: LoadModelResult = serde_json::from_value(raw)
            .map_err(|e| self.load_error(options, format!("malformed load response: {e}")))?;

        let modality = if loaded.is_vision_model { "vision" } else { "text" };
        let descriptor = ModelDescriptor {
            id: options.model_id.clone(),
            source: if local_path.is_some() {
                ModelSource::Local
            } else {
                ModelSource::HuggingFace
            },
            modality: modality.to_string(),
            family: family_of(&options.model_id),
            path: local_path,
        };
        let metadata = ModelMetadata {
            parameter_count: loaded.parameter_count,
            dtype: loaded.dtype,
            quantization: options.quantization.unwrap_or(self.config.default_quantization),
            revision: options.revision.clone(),
            tokenizer_type: loaded.tokenizer_type,
            is_vision_model: loaded.is_vision_model,
            memory_usage: loaded.memory_usage,
        };
        let handle = Arc::new(ModelHandle {
            descriptor: descriptor.clone(),
            state: ModelState::Ready,
            context_length: if loaded.context_length > 0 {
                loaded.context_length
            } else {
                self.config.default_context_length
            },
            metadata: metadata.clone(),
            draft: options.draft,
        });

        self.handles.insert(
            key.to_string(),
            LoadedModel {
                handle: Arc::clone(&handle),
                last_access: Instant::now(),
            },
        );
        self.descriptors.insert(options.model_id.clone(), descriptor);
        self.metadata_cache.insert(key.to_string(), metadata);

        if self.config.track_stats {
            let mut stats = self.stats.entry(key.to_string()).or_default();
            stats.loads += 1;
            stats.last_load_ms = started.elapsed().as_secs_f64() * 1000.0;
        }

        // On a cache miss, backfill artifacts from wherever the worker
        // actually loaded. Failures are logged, never surfaced.
        if !artifact_hit {
            if let (Some(artifacts), Some(cached_path)) =
                (self.artifacts.clone(), loaded.cached_path.clone())
            {
                let metadata_json = json!({
                    "model_id": options.model_id,
                    "revision": options.revision,
                });
                tokio::spawn(async move {
                    if let Err(e) = artifacts
                        .store(&artifact_key, Path::new(&cached_path), metadata_json)
                        .await
                    {
                        warn!(error = %e, "Artifact store after load failed");
                    }
                });
            }
        }

        info!(
            model = %options.model_id,
            variant = %key,
            draft = options.draft,
            load_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
            "Model loaded"
        );
        Ok(handle)
    }

    fn lru_variant(&self) -> Option<String> {
        self.handles
            .iter()
            .min_by_key(|e| e.last_access)
            .map(|e| e.key().clone())
    }

    /// Unload one variant. The RPC goes first; local state is only
    /// touched after the worker confirmed.
    async fn unload_variant(self: &Arc<Self>, variant_key: &str) -> Result<()> {
        let model_id = {
            let Some(loaded) = self.handles.get(variant_key) else {
                return Err(GantryError::NotFound(format!("variant {variant_key}")));
            };
            loaded.handle.descriptor.id.clone()
        };

        let params = UnloadModelParams {
            model_id: model_id.clone(),
        };
        let conn = self.pool.acquire(None).await?;
        let result = conn
            .link
            .request(methods::UNLOAD_MODEL, serde_json::to_value(&params)?, None)
            .await;
        self.pool.release(&conn).await;
        result?;

        self.handles.remove(variant_key);
        self.draft_pairs.retain(|primary, draft| {
            primary != &model_id && draft != &model_id
        });
        info!(model = %model_id, variant = %variant_key, "Model unloaded");
        Ok(())
    }

    /// Unload every loaded variant of a model id.
    pub async fn unload_model(self: &Arc<Self>, model_id: &str) -> Result<()> {
        let variants: Vec<String> = self
            .handles
            .iter()
            .filter(|e| e.handle.descriptor.id == model_id)
            .map(|e| e.key().clone())
            .collect();
        if variants.is_empty() {
            return Err(GantryError::NotFound(format!("model {model_id}")));
        }
        for variant in variants {
            self.unload_variant(&variant).await?;
        }
        Ok(())
    }

    /// Tokenize through the worker (bypasses batching; the batcher has
    /// its own path).
    pub async fn tokenize(&self, model_id: &str, text: &str) -> Result<TokenizeResult> {
        let params = TokenizeParams {
            model_id: model_id.to_string(),
            text: text.to_string(),
            add_special_tokens: None,
        };
        let conn = self.pool.acquire(None).await?;
        let result = conn
            .link
            .request(methods::TOKENIZE, serde_json::to_value(&params)?, None)
            .await;
        self.pool.release(&conn).await;
        Ok(serde_json::from_value(result?)?)
    }

    /// Draft compatibility check with auto-pairing on success.
    pub async fn check_draft_compatibility(
        &self,
        primary_id: &str,
        draft_id: &str,
    ) -> Result<DraftCompatibility> {
        let params = CheckDraftParams {
            primary_id: primary_id.to_string(),
            draft_id: draft_id.to_string(),
        };
        let conn = self.pool.acquire(None).await?;
        let result = conn
            .link
            .request(methods::CHECK_DRAFT, serde_json::to_value(&params)?, None)
            .await;
        self.pool.release(&conn).await;

        let compatibility: DraftCompatibility = serde_json::from_value(result?)
            .map_err(|e| GantryError::Runtime(format!("malformed check_draft response: {e}")))?;

        if compatibility.compatible {
            self.draft_pairs
                .insert(primary_id.to_string(), draft_id.to_string());
            debug!(primary = %primary_id, draft = %draft_id, "Draft pair registered");
        }
        Ok(compatibility)
    }

    /// Paired draft for a primary model, if any
    pub fn draft_for(&self, primary_id: &str) -> Option<String> {
        self.draft_pairs.get(primary_id).map(|d| d.clone())
    }

    /// Load the configured warmup models; failures are logged only.
    pub async fn warmup(self: &Arc<Self>) {
        for model_id in self.config.warmup_on_start.clone() {
            info!(model = %model_id, "Warmup load");
            if let Err(e) = self.load_model(LoadOptions::new(&model_id)).await {
                warn!(model = %model_id, error = %e, "Warmup load failed");
            }
        }
    }

    pub fn handle(&self, options: &LoadOptions) -> Option<Arc<ModelHandle>> {
        self.handles
            .get(&options.variant_key())
            .map(|l| Arc::clone(&l.handle))
    }

    pub fn descriptor(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.descriptors.get(model_id).map(|d| d.clone())
    }

    pub fn loaded_count(&self) -> usize {
        self.handles.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn variant_stats(&self, variant_key: &str) -> Option<VariantStats> {
        self.stats.get(variant_key).map(|s| s.clone())
    }

    /// Close the load queue; pending loads fail with a shutdown error.
    pub fn shutdown(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, ConnectionPoolConfig};
    use crate::rpc::testing::MockWorkerLink;
    use crate::rpc::WorkerLink;
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    struct SharedLinkFactory {
        link: Arc<MockWorkerLink>,
    }

    #[async_trait]
    impl ConnectionFactory for SharedLinkFactory {
        async fn connect(
            &self,
            _preferred_worker: Option<&str>,
        ) -> Result<(String, Arc<dyn WorkerLink>)> {
            Ok((
                "worker-0".to_string(),
                Arc::clone(&self.link) as Arc<dyn WorkerLink>,
            ))
        }
    }

    fn load_result() -> Value {
        json!({
            "state": "ready",
            "context_length": 8192,
            "parameter_count": 1_000_000_000u64,
            "dtype": "bf16",
            "is_vision_model": false,
            "tokenizer_type": "bpe",
            "memory_usage": 2_000_000u64
        })
    }

    async fn pool_for(link: Arc<MockWorkerLink>) -> Arc<ConnectionPool> {
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                min_connections: 1,
                max_connections: 4,
                warmup_on_start: false,
                health_check_interval: Duration::from_secs(3600),
                ..ConnectionPoolConfig::default()
            },
            Arc::new(SharedLinkFactory { link }),
        );
        pool.start().await.unwrap();
        pool
    }

    fn manager_with(
        link: Arc<MockWorkerLink>,
        config: ModelManagerConfig,
        artifacts: Option<Arc<ArtifactCache>>,
    ) -> impl std::future::Future<Output = Arc<ModelManager>> {
        async move {
            let pool = pool_for(link).await;
            ModelManager::new(config, pool, artifacts)
        }
    }

    #[tokio::test]
    async fn test_inflight_dedup_single_rpc() {
        let link = Arc::new(
            MockWorkerLink::new(|method, _| match method {
                methods::LOAD_MODEL => Ok(load_result()),
                _ => Ok(Value::Null),
            })
            .with_delay(Duration::from_millis(50)),
        );
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        let loads = (0..3).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .load_model(LoadOptions::new("m1").with_revision("main"))
                    .await
            })
        });
        let handles: Vec<Arc<ModelHandle>> = futures::future::join_all(loads)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(link.call_count(methods::LOAD_MODEL), 1);
        assert!(Arc::ptr_eq(&handles[0], &handles[1]));
        assert!(Arc::ptr_eq(&handles[1], &handles[2]));
        assert_eq!(manager.inflight_count(), 0);
        assert_eq!(manager.loaded_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_revisions_load_separately() {
        let link = Arc::new(
            MockWorkerLink::new(|method, _| match method {
                methods::LOAD_MODEL => Ok(load_result()),
                _ => Ok(Value::Null),
            })
            .with_delay(Duration::from_millis(20)),
        );
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        let main = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .load_model(LoadOptions::new("m1").with_revision("main"))
                    .await
            })
        };
        let dev = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .load_model(LoadOptions::new("m1").with_revision("dev"))
                    .await
            })
        };
        let a = main.await.unwrap().unwrap();
        let b = dev.await.unwrap().unwrap();

        assert_eq!(link.call_count(methods::LOAD_MODEL), 2);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(manager.loaded_count(), 2);
    }

    #[tokio::test]
    async fn test_admission_counts_handles_and_inflight() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::LOAD_MODEL => Ok(load_result()),
            _ => Ok(Value::Null),
        }));
        let config = ModelManagerConfig {
            max_loaded_models: 1,
            max_cached_models: 8,
            memory_cache_enabled: false,
            ..ModelManagerConfig::default()
        };
        let manager = manager_with(Arc::clone(&link), config, None).await;

        manager.load_model(LoadOptions::new("m1")).await.unwrap();
        let denied = manager.load_model(LoadOptions::new("m2")).await;
        assert!(matches!(denied, Err(GantryError::ModelLoad(_))));
        assert_eq!(manager.loaded_count(), 1);
    }

    #[tokio::test]
    async fn test_shared_failure_reaches_each_caller() {
        let link = Arc::new(
            MockWorkerLink::new(|method, _| match method {
                methods::LOAD_MODEL => {
                    Err(GantryError::Runtime("out of memory".to_string()))
                }
                _ => Ok(Value::Null),
            })
            .with_delay(Duration::from_millis(50)),
        );
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        let loads = (0..3).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.load_model(LoadOptions::new("m1")).await })
        });
        let results = futures::future::join_all(loads).await;
        for result in results {
            let err = result.unwrap().unwrap_err();
            assert!(matches!(err, GantryError::ModelLoad(_)));
            assert!(err.to_string().contains("out of memory"));
        }
        // One RPC despite three callers, and no stale state
        assert_eq!(link.call_count(methods::LOAD_MODEL), 1);
        assert_eq!(manager.loaded_count(), 0);
        assert_eq!(manager.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_issues_unload() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::LOAD_MODEL => Ok(load_result()),
            _ => Ok(Value::Null),
        }));
        let config = ModelManagerConfig {
            max_loaded_models: 4,
            max_cached_models: 1,
            ..ModelManagerConfig::default()
        };
        let manager = manager_with(Arc::clone(&link), config, None).await;

        manager.load_model(LoadOptions::new("m1")).await.unwrap();
        manager.load_model(LoadOptions::new("m2")).await.unwrap();

        assert_eq!(link.call_count(methods::UNLOAD_MODEL), 1);
        assert_eq!(manager.loaded_count(), 1);
        assert!(manager.handle(&LoadOptions::new("m2")).is_some());
        assert!(manager.handle(&LoadOptions::new("m1")).is_none());
    }

    #[tokio::test]
    async fn test_unload_keeps_descriptor_cache() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::LOAD_MODEL => Ok(load_result()),
            _ => Ok(Value::Null),
        }));
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        manager.load_model(LoadOptions::new("m1")).await.unwrap();
        manager.unload_model("m1").await.unwrap();

        assert_eq!(manager.loaded_count(), 0);
        assert!(manager.descriptor("m1").is_some());
        assert!(manager.unload_model("m1").await.is_err());
    }

    #[tokio::test]
    async fn test_unload_rpc_failure_keeps_handle() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::LOAD_MODEL => Ok(load_result()),
            methods::UNLOAD_MODEL => Err(GantryError::Runtime("busy".to_string())),
            _ => Ok(Value::Null),
        }));
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        manager.load_model(LoadOptions::new("m1")).await.unwrap();
        assert!(manager.unload_model("m1").await.is_err());
        // RPC failed: local state untouched
        assert_eq!(manager.loaded_count(), 1);
    }

    #[tokio::test]
    async fn test_artifact_miss_store_then_hit() {
        let tmp = TempDir::new().unwrap();
        // Directory the worker claims to have loaded from
        let worker_cache = tmp.path().join("worker-cache");
        tokio::fs::create_dir_all(&worker_cache).await.unwrap();
        tokio::fs::write(worker_cache.join("weights.bin"), vec![1u8; 512])
            .await
            .unwrap();

        let cached_path = worker_cache.to_string_lossy().to_string();
        let link = Arc::new(MockWorkerLink::new(move |method, _| match method {
            methods::LOAD_MODEL => {
                let mut result = load_result();
                result["cached_path"] = json!(cached_path.clone());
                Ok(result)
            }
            _ => Ok(Value::Null),
        }));

        let artifacts = ArtifactCache::open(crate::artifact::ArtifactCacheConfig {
            root: tmp.path().join("cache"),
            ..crate::artifact::ArtifactCacheConfig::default()
        })
        .await
        .unwrap();

        let manager = manager_with(
            Arc::clone(&link),
            ModelManagerConfig::default(),
            Some(Arc::clone(&artifacts)),
        )
        .await;

        // First load: miss, async store backfills the cache
        manager
            .load_model(LoadOptions::new("llama-3.2-1B-instruct-4bit"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(artifacts.entry_count().await, 1);
        let stats = artifacts.stats().await;
        assert_eq!(stats.cache_hits, 0);

        // Unload, reload: hit, and the worker receives local_path
        manager.unload_model("llama-3.2-1B-instruct-4bit").await.unwrap();
        manager
            .load_model(LoadOptions::new("llama-3.2-1B-instruct-4bit"))
            .await
            .unwrap();

        let stats = artifacts.stats().await;
        assert!(stats.cache_hits >= 1);

        let calls = link.calls.lock().unwrap();
        let second_load = calls
            .iter()
            .filter(|(m, _)| m == methods::LOAD_MODEL)
            .nth(1)
            .cloned()
            .unwrap();
        assert!(second_load.1.get("local_path").and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn test_check_draft_pairs_on_compatible() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::CHECK_DRAFT => Ok(json!({
                "compatible": true,
                "errors": [],
                "warnings": ["vocab overlap 99%"],
                "details": {
                    "primary_model": "m-big",
                    "draft_model": "m-small",
                    "performance_estimate": {
                        "expected_speedup": 1.8,
                        "size_ratio": 0.12,
                        "recommendation": "recommended"
                    }
                }
            })),
            _ => Ok(Value::Null),
        }));
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        let compatibility = manager
            .check_draft_compatibility("m-big", "m-small")
            .await
            .unwrap();
        assert!(compatibility.compatible);
        assert_eq!(compatibility.details.performance_estimate.expected_speedup, 1.8);
        assert_eq!(manager.draft_for("m-big").as_deref(), Some("m-small"));
    }

    #[tokio::test]
    async fn test_draft_load_failure_is_generation_error() {
        let link = Arc::new(MockWorkerLink::new(|method, _| match method {
            methods::LOAD_MODEL => Err(GantryError::Runtime("no draft support".to_string())),
            _ => Ok(Value::Null),
        }));
        let manager = manager_with(Arc::clone(&link), ModelManagerConfig::default(), None).await;

        let err = manager
            .load_model(LoadOptions::new("m-small").as_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::Generation(_)));
    }
}
