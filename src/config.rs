//! Configuration for Gantry
//!
//! CLI arguments and environment variable handling using clap. Every
//! recognized option maps onto one component's config struct; `main.rs`
//! performs that mapping. `validate()` rejects inconsistent settings
//! before any component starts.

use clap::Parser;
use uuid::Uuid;

/// Gantry - orchestration and streaming control plane for model inference workers
#[derive(Parser, Debug, Clone)]
#[command(name = "gantry")]
#[command(about = "Control plane between generation clients and inference worker processes")]
pub struct Args {
    /// Unique node identifier for this control-plane instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Optional cluster configuration YAML (with ${VAR} interpolation)
    #[arg(long, env = "CLUSTER_CONFIG")]
    pub cluster_config: Option<String>,

    /// Enable distributed mode (NATS bus, heartbeat publishing)
    #[arg(long, env = "DISTRIBUTED", default_value = "false")]
    pub distributed: bool,

    /// Worker runtime configuration
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    /// JSON-RPC transport configuration
    #[command(flatten)]
    pub rpc: RpcArgs,

    /// Worker pool configuration
    #[command(flatten)]
    pub workers: WorkerArgs,

    /// Connection pool configuration
    #[command(flatten)]
    pub connections: ConnectionArgs,

    /// Model manager configuration
    #[command(flatten)]
    pub model: ModelArgs,

    /// Artifact cache configuration
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Stream registry / generator configuration
    #[command(flatten)]
    pub streams: StreamArgs,

    /// Batching configuration
    #[command(flatten)]
    pub batch: BatchArgs,

    /// QoS / regression configuration
    #[command(flatten)]
    pub qos: QosArgs,

    /// Prompt result cache configuration
    #[command(flatten)]
    pub prompt_cache: PromptCacheArgs,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,
}

/// External worker runtime (spawned child process)
#[derive(Parser, Debug, Clone)]
pub struct RuntimeArgs {
    /// Runtime interpreter executable
    #[arg(long, env = "RUNTIME_EXECUTABLE", default_value = "python3")]
    pub runtime_executable: String,

    /// Runtime entry script handed to the interpreter
    #[arg(long, env = "RUNTIME_SCRIPT", default_value = "runtime/worker.py")]
    pub runtime_script: String,

    /// Worker startup timeout in milliseconds (ready handshake)
    #[arg(long, env = "RUNTIME_STARTUP_TIMEOUT_MS", default_value = "30000")]
    pub startup_timeout_ms: u64,

    /// Worker graceful shutdown timeout in milliseconds
    #[arg(long, env = "RUNTIME_SHUTDOWN_TIMEOUT_MS", default_value = "10000")]
    pub shutdown_timeout_ms: u64,

    /// Base delay for worker restart backoff in milliseconds
    #[arg(long, env = "RUNTIME_RESTART_DELAY_MS", default_value = "1000")]
    pub restart_delay_ms: u64,
}

/// Line-framed JSON-RPC transport
#[derive(Parser, Debug, Clone)]
pub struct RpcArgs {
    /// Default RPC timeout in milliseconds
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "30000")]
    pub rpc_timeout_ms: u64,

    /// Maximum accepted line length in bytes
    #[arg(long, env = "RPC_MAX_LINE_BYTES", default_value = "10485760")]
    pub rpc_max_line_bytes: usize,

    /// Maximum in-flight requests per transport
    #[arg(long, env = "RPC_MAX_PENDING", default_value = "1000")]
    pub rpc_max_pending: usize,

    /// Circuit breaker: failures within the window before opening
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "5")]
    pub breaker_failure_threshold: usize,

    /// Circuit breaker: open → half-open delay in milliseconds
    #[arg(long, env = "BREAKER_RECOVERY_TIMEOUT_MS", default_value = "30000")]
    pub breaker_recovery_timeout_ms: u64,

    /// Circuit breaker: max trial calls while half-open
    #[arg(long, env = "BREAKER_HALF_OPEN_MAX_CALLS", default_value = "1")]
    pub breaker_half_open_max_calls: usize,

    /// Circuit breaker: successes in half-open required to close
    #[arg(long, env = "BREAKER_HALF_OPEN_SUCCESS_THRESHOLD", default_value = "2")]
    pub breaker_half_open_success_threshold: usize,

    /// Circuit breaker: rolling failure window in milliseconds
    #[arg(long, env = "BREAKER_FAILURE_WINDOW_MS", default_value = "60000")]
    pub breaker_failure_window_ms: u64,
}

/// Worker pool manager and router
#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Number of inference workers to spawn
    #[arg(long, env = "WORKER_COUNT", default_value = "2")]
    pub worker_count: usize,

    /// Maximum automatic restarts per worker before abandoning it
    #[arg(long, env = "WORKER_MAX_RESTARTS", default_value = "3")]
    pub max_restarts: u32,

    /// Heartbeat monitor interval in milliseconds
    #[arg(long, env = "WORKER_HEALTH_CHECK_INTERVAL_MS", default_value = "5000")]
    pub health_check_interval_ms: u64,

    /// Heartbeat staleness before a worker is marked failed, in milliseconds
    #[arg(long, env = "WORKER_HEARTBEAT_TIMEOUT_MS", default_value = "15000")]
    pub heartbeat_timeout_ms: u64,

    /// Routing strategy: round-robin or least-busy
    #[arg(long, env = "ROUTING_STRATEGY", default_value = "round-robin")]
    pub routing_strategy: String,

    /// Rolling restart: per-worker drain timeout in milliseconds
    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value = "30000")]
    pub drain_timeout_ms: u64,

    /// Rolling restart: replacement preflight timeout in milliseconds
    #[arg(long, env = "PREFLIGHT_TIMEOUT_MS", default_value = "10000")]
    pub preflight_timeout_ms: u64,

    /// Minimum active workers the rolling restart must preserve
    #[arg(long, env = "MIN_ACTIVE_WORKERS", default_value = "1")]
    pub min_active_workers: usize,

    /// Rolling restart watchdog interval in milliseconds
    #[arg(long, env = "WATCHDOG_INTERVAL_MS", default_value = "1000")]
    pub watchdog_interval_ms: u64,

    /// Replay requests that were still in flight when a drain timed out
    #[arg(long, env = "REQUEST_REPLAY_ENABLED", default_value = "false")]
    pub request_replay_enabled: bool,

    /// Maximum replay attempts per drained worker
    #[arg(long, env = "MAX_REPLAY_ATTEMPTS", default_value = "2")]
    pub max_replay_attempts: u32,
}

/// Persistent worker connection pool
#[derive(Parser, Debug, Clone)]
pub struct ConnectionArgs {
    /// Enable the connection pool (disable for one-shot connections)
    #[arg(long, env = "POOL_ENABLED", default_value = "true")]
    pub pool_enabled: bool,

    /// Minimum warm connections
    #[arg(long, env = "POOL_MIN_CONNECTIONS", default_value = "1")]
    pub min_connections: usize,

    /// Maximum connections
    #[arg(long, env = "POOL_MAX_CONNECTIONS", default_value = "4")]
    pub max_connections: usize,

    /// Acquire timeout in milliseconds for queued waiters
    #[arg(long, env = "POOL_ACQUIRE_TIMEOUT_MS", default_value = "5000")]
    pub acquire_timeout_ms: u64,

    /// Idle connection eviction threshold in milliseconds
    #[arg(long, env = "POOL_IDLE_TIMEOUT_MS", default_value = "60000")]
    pub idle_timeout_ms: u64,

    /// Health check interval in milliseconds
    #[arg(long, env = "POOL_HEALTH_CHECK_INTERVAL_MS", default_value = "30000")]
    pub pool_health_check_interval_ms: u64,

    /// Create min_connections eagerly on startup
    #[arg(
        id = "pool_warmup_on_start",
        long = "pool-warmup-on-start",
        env = "POOL_WARMUP_ON_START",
        default_value = "true"
    )]
    pub warmup_on_start: bool,
}

/// Model manager and loaded-handle cache
#[derive(Parser, Debug, Clone)]
pub struct ModelArgs {
    /// Default context length reported for models that omit one
    #[arg(long, env = "MODEL_DEFAULT_CONTEXT_LENGTH", default_value = "4096")]
    pub default_context_length: u32,

    /// Maximum concurrently loaded models (handles + inflight loads)
    #[arg(long, env = "MODEL_MAX_LOADED", default_value = "4")]
    pub max_loaded_models: usize,

    /// Default quantization: none, int8, int4
    #[arg(long, env = "MODEL_DEFAULT_QUANTIZATION", default_value = "none")]
    pub default_quantization: String,

    /// Enable the in-memory LRU of loaded handles
    #[arg(long, env = "MODEL_MEMORY_CACHE_ENABLED", default_value = "true")]
    pub memory_cache_enabled: bool,

    /// Maximum handles kept in the memory cache before LRU unload
    #[arg(long, env = "MODEL_MAX_CACHED", default_value = "4")]
    pub max_cached_models: usize,

    /// Comma-separated model ids to load at startup
    #[arg(
        id = "model_warmup_on_start",
        long = "model-warmup-on-start",
        env = "MODEL_WARMUP_ON_START"
    )]
    pub warmup_on_start: Option<String>,

    /// Track per-variant load statistics
    #[arg(long, env = "MODEL_TRACK_STATS", default_value = "true")]
    pub track_stats: bool,
}

/// On-disk artifact cache
#[derive(Parser, Debug, Clone)]
pub struct CacheArgs {
    /// Enable the artifact cache
    #[arg(long, env = "CACHE_ENABLED", default_value = "true")]
    pub cache_enabled: bool,

    /// Cache root directory
    #[arg(long, env = "CACHE_DIR", default_value = ".gantry-cache")]
    pub cache_dir: String,

    /// Maximum cache size in bytes (default 50 GiB)
    #[arg(long, env = "CACHE_MAX_SIZE_BYTES", default_value = "53687091200")]
    pub cache_max_size_bytes: u64,

    /// Drop entries older than this many days (0 = no age limit)
    #[arg(long, env = "CACHE_MAX_AGE_DAYS", default_value = "0")]
    pub cache_max_age_days: u32,

    /// Validate index entries against disk on startup
    #[arg(long, env = "CACHE_VALIDATE_ON_STARTUP", default_value = "true")]
    pub cache_validate_on_startup: bool,
}

/// Stream registry and generator queues
#[derive(Parser, Debug, Clone)]
pub struct StreamArgs {
    /// Default per-stream timeout in milliseconds
    #[arg(long, env = "STREAM_DEFAULT_TIMEOUT_MS", default_value = "120000")]
    pub stream_default_timeout_ms: u64,

    /// Maximum concurrently active streams
    #[arg(long, env = "STREAM_MAX_ACTIVE", default_value = "256")]
    pub max_active_streams: usize,

    /// Registry sweep interval for expired records, in milliseconds
    #[arg(long, env = "STREAM_CLEANUP_INTERVAL_MS", default_value = "30000")]
    pub stream_cleanup_interval_ms: u64,

    /// Per-stream chunk queue capacity
    #[arg(long, env = "STREAM_HIGH_WATER_MARK", default_value = "64")]
    pub high_water_mark: usize,

    /// Maximum pooled chunk queues
    #[arg(long, env = "STREAM_QUEUE_POOL_MAX", default_value = "128")]
    pub queue_pool_max: usize,
}

/// Request batching and adaptive sizing
#[derive(Parser, Debug, Clone)]
pub struct BatchArgs {
    /// Enable request batching
    #[arg(long, env = "BATCHING_ENABLED", default_value = "true")]
    pub batching_enabled: bool,

    /// Maximum requests per batch
    #[arg(long, env = "BATCH_SIZE", default_value = "8")]
    pub batch_size: usize,

    /// Flush interval (head-of-queue deadline) in milliseconds
    #[arg(long, env = "BATCH_TIMEOUT_MS", default_value = "10")]
    pub batch_timeout_ms: u64,

    /// Enable the adaptive batch-size controller
    #[arg(long, env = "ADAPTIVE_BATCHING_ENABLED", default_value = "false")]
    pub adaptive_enabled: bool,

    /// Adaptive controller lower bound
    #[arg(long, env = "ADAPTIVE_MIN_BATCH_SIZE", default_value = "1")]
    pub adaptive_min_batch_size: usize,

    /// Adaptive controller upper bound
    #[arg(long, env = "ADAPTIVE_MAX_BATCH_SIZE", default_value = "32")]
    pub adaptive_max_batch_size: usize,

    /// Batch size used when the worker's adaptive component is unreachable
    #[arg(long, env = "ADAPTIVE_DEFAULT_BATCH_SIZE", default_value = "8")]
    pub adaptive_default_batch_size: usize,

    /// Adaptive feedback interval in milliseconds
    #[arg(long, env = "ADAPTIVE_UPDATE_INTERVAL_MS", default_value = "5000")]
    pub adaptive_update_interval_ms: u64,
}

/// QoS engine, metrics aggregation, regression detection
#[derive(Parser, Debug, Clone)]
pub struct QosArgs {
    /// Enable QoS policy evaluation
    #[arg(long, env = "QOS_ENABLED", default_value = "true")]
    pub qos_enabled: bool,

    /// Metric aggregation interval in milliseconds
    #[arg(long, env = "QOS_AGGREGATION_INTERVAL_MS", default_value = "10000")]
    pub aggregation_interval_ms: u64,

    /// Evaluate policies without executing remediations
    #[arg(long, env = "QOS_DRY_RUN", default_value = "false")]
    pub qos_dry_run: bool,

    /// Regression check interval in milliseconds
    #[arg(long, env = "REGRESSION_CHECK_INTERVAL_MS", default_value = "30000")]
    pub regression_check_interval_ms: u64,

    /// Minimum samples before regression alerts fire
    #[arg(long, env = "REGRESSION_MIN_SAMPLES", default_value = "10")]
    pub regression_min_samples: usize,

    /// Automatically emit rollback on critical regressions
    #[arg(long, env = "AUTO_ROLLBACK_ENABLED", default_value = "false")]
    pub auto_rollback_enabled: bool,
}

/// Prompt result cache
#[derive(Parser, Debug, Clone)]
pub struct PromptCacheArgs {
    /// Enable the prompt result cache
    #[arg(long, env = "PROMPT_CACHE_ENABLED", default_value = "false")]
    pub prompt_cache_enabled: bool,

    /// Maximum cached responses
    #[arg(long, env = "PROMPT_CACHE_MAX_ENTRIES", default_value = "1024")]
    pub prompt_cache_max_entries: usize,

    /// Maximum cached tokens across all entries
    #[arg(long, env = "PROMPT_CACHE_MAX_TOTAL_TOKENS", default_value = "1048576")]
    pub prompt_cache_max_total_tokens: u64,

    /// Maximum cached bytes across all entries (default 256 MiB)
    #[arg(long, env = "PROMPT_CACHE_MAX_TOTAL_BYTES", default_value = "268435456")]
    pub prompt_cache_max_total_bytes: u64,

    /// Entry TTL in milliseconds
    #[arg(long, env = "PROMPT_CACHE_TTL_MS", default_value = "3600000")]
    pub prompt_cache_ttl_ms: u64,

    /// Optional JSON persistence file
    #[arg(long, env = "PROMPT_CACHE_PERSIST_PATH")]
    pub prompt_cache_persist_path: Option<String>,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Get the list of model ids to warm up at startup
    pub fn warmup_model_list(&self) -> Vec<String> {
        self.model
            .warmup_on_start
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.workers.worker_count == 0 {
            return Err("WORKER_COUNT must be at least 1".to_string());
        }

        if self.workers.min_active_workers > self.workers.worker_count {
            return Err(
                "MIN_ACTIVE_WORKERS must be less than or equal to WORKER_COUNT".to_string(),
            );
        }

        if self.connections.min_connections > self.connections.max_connections {
            return Err(
                "POOL_MIN_CONNECTIONS must be less than or equal to POOL_MAX_CONNECTIONS"
                    .to_string(),
            );
        }

        if self.model.max_loaded_models == 0 {
            return Err("MODEL_MAX_LOADED must be at least 1".to_string());
        }

        if self.batch.adaptive_min_batch_size > self.batch.adaptive_max_batch_size {
            return Err(
                "ADAPTIVE_MIN_BATCH_SIZE must be less than or equal to ADAPTIVE_MAX_BATCH_SIZE"
                    .to_string(),
            );
        }

        match self.workers.routing_strategy.as_str() {
            "round-robin" | "least-busy" => {}
            other => {
                return Err(format!(
                    "ROUTING_STRATEGY must be round-robin or least-busy, got '{other}'"
                ));
            }
        }

        match self.model.default_quantization.as_str() {
            "none" | "int8" | "int4" => {}
            other => {
                return Err(format!(
                    "MODEL_DEFAULT_QUANTIZATION must be none, int8 or int4, got '{other}'"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["gantry"])
    }

    #[test]
    fn test_defaults_validate() {
        let args = default_args();
        assert!(args.validate().is_ok());
        assert_eq!(args.workers.worker_count, 2);
        assert_eq!(args.streams.high_water_mark, 64);
        assert_eq!(args.streams.queue_pool_max, 128);
    }

    #[test]
    fn test_bad_routing_strategy_rejected() {
        let mut args = default_args();
        args.workers.routing_strategy = "random".to_string();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_min_active_bounded_by_worker_count() {
        let mut args = default_args();
        args.workers.min_active_workers = 5;
        args.workers.worker_count = 2;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_warmup_model_list_parses() {
        let mut args = default_args();
        args.model.warmup_on_start = Some("llama-3.2-1b, qwen-0.5b ,".to_string());
        assert_eq!(args.warmup_model_list(), vec!["llama-3.2-1b", "qwen-0.5b"]);
    }
}
