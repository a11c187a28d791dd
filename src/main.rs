//! Gantry - orchestration and streaming control plane for model
//! inference workers

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use gantry::artifact::{ArtifactCache, ArtifactCacheConfig};
use gantry::batch::{AdaptiveConfig, AdaptiveController, BatcherConfig, RequestBatcher};
use gantry::breaker::{BreakerConfig, BreakerRegistry};
use gantry::bus::{spawn_heartbeat_publisher, BusClient, BusConfig};
use gantry::cluster::ClusterConfig;
use gantry::config::Args;
use gantry::connection::{ConnectionFactory, ConnectionPool, ConnectionPoolConfig};
use gantry::logging::init_tracing;
use gantry::model::{ModelManager, ModelManagerConfig, Quantization};
use gantry::promptcache::{PromptCacheConfig, PromptResultCache};
use gantry::qos::{
    ExecutorConfig, MetricsAggregator, MetricsAggregatorConfig, QosEngine, QosEngineConfig,
    RegressionConfig, RegressionDetector, Remediation, RemediationExecutor, RemediationSpec,
};
use gantry::rpc::{TransportConfig, WorkerLink};
use gantry::stream::{
    GeneratorFactory, GeneratorFactoryConfig, StreamRegistry, StreamRegistryConfig,
    TelemetryHooks,
};
use gantry::types::Result;
use gantry::worker::{
    ProcessSpawner, RollingRestartConfig, RollingRestartCoordinator, RoutingStrategy,
    RuntimeConfig, RuntimeRouter, WorkerPoolConfig, WorkerPoolManager, WorkerSpawner,
};

/// Connection factory backed by the worker pool: preferred workers
/// resolve to their existing link, otherwise a dedicated runtime is
/// spawned for the connection.
struct PooledWorkerFactory {
    manager: Arc<WorkerPoolManager>,
    spawner: Arc<dyn WorkerSpawner>,
}

#[async_trait]
impl ConnectionFactory for PooledWorkerFactory {
    async fn connect(
        &self,
        preferred_worker: Option<&str>,
    ) -> Result<(String, Arc<dyn WorkerLink>)> {
        if let Some(worker_id) = preferred_worker {
            if let Some(link) = self.manager.link(worker_id) {
                return Ok((worker_id.to_string(), link));
            }
        }
        // Any pooled worker will do
        for worker_id in self.manager.worker_ids() {
            if let Some(link) = self.manager.link(&worker_id) {
                if link.is_alive() {
                    return Ok((worker_id, link));
                }
            }
        }
        // No pool workers yet: spawn a dedicated runtime
        let spawned = self.spawner.spawn().await?;
        Ok((format!("standalone-{:?}", spawned.pid), spawned.link))
    }
}

/// Restart remediation: kicks off a rolling restart.
struct RestartRemediation {
    coordinator: Arc<RollingRestartCoordinator>,
}

#[async_trait]
impl Remediation for RestartRemediation {
    fn name(&self) -> &str {
        "restart"
    }

    async fn execute(&self, _spec: &RemediationSpec) -> Result<()> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            if let Err(e) = coordinator.restart_all().await {
                warn!(error = %e, "Remediation rolling restart failed");
            }
        });
        Ok(())
    }
}

/// Throttle remediation: clamps the adaptive batch size to minimum.
struct ThrottleRemediation {
    controller: Arc<AdaptiveController>,
    min_batch_size: usize,
}

#[async_trait]
impl Remediation for ThrottleRemediation {
    fn name(&self) -> &str {
        "throttle"
    }

    async fn execute(&self, spec: &RemediationSpec) -> Result<()> {
        info!(target = %spec.target, "Throttling: pinning batch size to minimum");
        self.controller
            .apply_recommendation(&gantry::rpc::messages::AdaptiveRecommendation {
                recommended_size: self.min_batch_size,
                current_size: self.controller.current_size(),
                ema_latency: None,
                reason: Some("qos throttle remediation".to_string()),
            });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Gantry - inference control plane");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Workers: {}", args.workers.worker_count);
    info!("Routing: {}", args.workers.routing_strategy);
    info!("Runtime: {} {}", args.runtime.runtime_executable, args.runtime.runtime_script);
    info!("Artifact cache: {} ({})", args.cache.cache_dir, if args.cache.cache_enabled { "enabled" } else { "disabled" });
    info!("Batching: {}", if args.batch.batching_enabled { "enabled" } else { "disabled" });
    info!("Distributed: {}", args.distributed);
    info!("======================================");

    // Optional cluster configuration
    let cluster = match &args.cluster_config {
        Some(path) => Some(ClusterConfig::load(std::path::Path::new(path)).await?),
        None => None,
    };

    // Circuit breakers, one per worker, shared template
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        name: "worker".to_string(),
        failure_threshold: args.rpc.breaker_failure_threshold,
        recovery_timeout: Duration::from_millis(args.rpc.breaker_recovery_timeout_ms),
        half_open_max_calls: args.rpc.breaker_half_open_max_calls,
        half_open_success_threshold: args.rpc.breaker_half_open_success_threshold,
        failure_window: Duration::from_millis(args.rpc.breaker_failure_window_ms),
    }));

    // Artifact cache
    let artifacts = if args.cache.cache_enabled {
        Some(
            ArtifactCache::open(ArtifactCacheConfig {
                enabled: true,
                root: PathBuf::from(&args.cache.cache_dir),
                max_size_bytes: args.cache.cache_max_size_bytes,
                max_age_days: args.cache.cache_max_age_days,
                validate_on_startup: args.cache.cache_validate_on_startup,
                ..ArtifactCacheConfig::default()
            })
            .await?,
        )
    } else {
        None
    };

    // Worker pool: spawner, router, manager
    let spawner: Arc<dyn WorkerSpawner> = Arc::new(ProcessSpawner::new(RuntimeConfig {
        executable: args.runtime.runtime_executable.clone(),
        script: args.runtime.runtime_script.clone(),
        args: Vec::new(),
        startup_timeout: Duration::from_millis(args.runtime.startup_timeout_ms),
        shutdown_timeout: Duration::from_millis(args.runtime.shutdown_timeout_ms),
        transport: TransportConfig {
            default_timeout: Duration::from_millis(args.rpc.rpc_timeout_ms),
            max_line_bytes: args.rpc.rpc_max_line_bytes,
            max_pending: args.rpc.rpc_max_pending,
        },
    }));
    let router = Arc::new(RuntimeRouter::new(RoutingStrategy::from_str(
        &args.workers.routing_strategy,
    )?));
    let manager = WorkerPoolManager::new(
        WorkerPoolConfig {
            worker_count: args.workers.worker_count,
            max_restarts: args.workers.max_restarts,
            restart_delay: Duration::from_millis(args.runtime.restart_delay_ms),
            health_check_interval: Duration::from_millis(args.workers.health_check_interval_ms),
            heartbeat_timeout: Duration::from_millis(args.workers.heartbeat_timeout_ms),
            shutdown_timeout: Duration::from_millis(args.runtime.shutdown_timeout_ms),
        },
        Arc::clone(&spawner),
        Arc::clone(&router),
    );
    manager.start().await?;

    // Connection pool over the workers
    let pool = ConnectionPool::new(
        ConnectionPoolConfig {
            enabled: args.connections.pool_enabled,
            min_connections: args.connections.min_connections,
            max_connections: args.connections.max_connections,
            acquire_timeout: Duration::from_millis(args.connections.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(args.connections.idle_timeout_ms),
            health_check_interval: Duration::from_millis(
                args.connections.pool_health_check_interval_ms,
            ),
            warmup_on_start: args.connections.warmup_on_start,
        },
        Arc::new(PooledWorkerFactory {
            manager: Arc::clone(&manager),
            spawner: Arc::clone(&spawner),
        }),
    );
    pool.start().await?;

    // Model manager
    let default_quantization =
        Quantization::from_str(&args.model.default_quantization).unwrap_or_default();
    let models = ModelManager::new(
        ModelManagerConfig {
            max_loaded_models: args.model.max_loaded_models,
            max_cached_models: args.model.max_cached_models,
            memory_cache_enabled: args.model.memory_cache_enabled,
            default_context_length: args.model.default_context_length,
            default_quantization,
            track_stats: args.model.track_stats,
            warmup_on_start: args.warmup_model_list(),
        },
        Arc::clone(&pool),
        artifacts.clone(),
    );

    // Stream registry, demuxing every worker's notifications
    let registry = StreamRegistry::new(StreamRegistryConfig {
        default_timeout: Duration::from_millis(args.streams.stream_default_timeout_ms),
        max_active_streams: args.streams.max_active_streams,
        cleanup_interval: Duration::from_millis(args.streams.stream_cleanup_interval_ms),
    });
    registry.start_cleanup();
    for worker_id in manager.worker_ids() {
        if let Some(link) = manager.link(&worker_id) {
            registry.attach_worker(&link);
        }
    }

    // Batching with optional adaptive sizing
    let adaptive = AdaptiveController::new(
        AdaptiveConfig {
            enabled: args.batch.adaptive_enabled,
            min_batch_size: args.batch.adaptive_min_batch_size,
            max_batch_size: args.batch.adaptive_max_batch_size,
            default_batch_size: args.batch.adaptive_default_batch_size,
            update_interval: Duration::from_millis(args.batch.adaptive_update_interval_ms),
        },
        Arc::clone(&pool),
    );
    adaptive.start().await;
    for worker_id in manager.worker_ids() {
        if let Some(link) = manager.link(&worker_id) {
            adaptive.attach_worker(&link).await;
        }
    }
    let batcher = if args.batch.batching_enabled {
        let batcher = RequestBatcher::new(
            BatcherConfig {
                enabled: true,
                max_batch_size: args.batch.batch_size,
                flush_interval: Duration::from_millis(args.batch.batch_timeout_ms),
            },
            Arc::clone(&pool),
            args.batch.adaptive_enabled.then(|| Arc::clone(&adaptive)),
        );
        batcher.start().await;
        Some(batcher)
    } else {
        None
    };

    // QoS substrate
    let aggregator = MetricsAggregator::new(MetricsAggregatorConfig {
        aggregation_interval: Duration::from_millis(args.qos.aggregation_interval_ms),
        ..MetricsAggregatorConfig::default()
    });
    aggregator.start();

    // Generation telemetry feeds the aggregator
    let hooks = {
        let aggregator = Arc::clone(&aggregator);
        let error_aggregator = Arc::clone(&aggregator);
        TelemetryHooks {
            on_token: None,
            on_completed: Some(Arc::new(move |stats| {
                aggregator.record("throughput", stats.tokens_per_second);
                aggregator.record("ttft", stats.time_to_first_token_ms);
                aggregator.record("latency", stats.total_time_ms);
                aggregator.record("error_rate", 0.0);
            })),
            on_error: Some(Arc::new(move |_| {
                error_aggregator.record("error_rate", 1.0);
            })),
        }
    };

    // Generator factory: the client-facing streaming surface
    let generators = GeneratorFactory::new(
        GeneratorFactoryConfig {
            high_water_mark: args.streams.high_water_mark,
            queue_pool_max: args.streams.queue_pool_max,
        },
        Arc::clone(&registry),
        Arc::clone(&router),
        Arc::clone(&pool),
        batcher.clone(),
        Some(Arc::clone(&breakers)),
        hooks,
    );

    // Prompt result cache
    let prompt_cache = if args.prompt_cache.prompt_cache_enabled {
        let cache = PromptResultCache::new(PromptCacheConfig {
            enabled: true,
            max_entries: args.prompt_cache.prompt_cache_max_entries,
            max_total_tokens: args.prompt_cache.prompt_cache_max_total_tokens,
            max_total_bytes: args.prompt_cache.prompt_cache_max_total_bytes,
            ttl: Duration::from_millis(args.prompt_cache.prompt_cache_ttl_ms),
            sweep_interval: Duration::from_secs(60),
            persist_path: args
                .prompt_cache
                .prompt_cache_persist_path
                .as_ref()
                .map(PathBuf::from),
        });
        cache.start().await?;
        Some(cache)
    } else {
        None
    };

    // Rolling restart coordinator with watchdog
    let coordinator = RollingRestartCoordinator::new(
        RollingRestartConfig {
            drain_timeout: Duration::from_millis(args.workers.drain_timeout_ms),
            preflight_timeout: Duration::from_millis(args.workers.preflight_timeout_ms),
            min_active_workers: args.workers.min_active_workers,
            watchdog_interval: Duration::from_millis(args.workers.watchdog_interval_ms),
            replay_enabled: args.workers.request_replay_enabled,
            max_replay_attempts: args.workers.max_replay_attempts,
            poll_interval: Duration::from_millis(250),
        },
        Arc::clone(&manager),
        Arc::clone(&breakers),
        None,
    );
    coordinator.start_watchdog().await;

    // QoS engine with built-in remediations
    let executor = RemediationExecutor::new(ExecutorConfig::default());
    executor.register(Arc::new(RestartRemediation {
        coordinator: Arc::clone(&coordinator),
    }));
    executor.register(Arc::new(ThrottleRemediation {
        controller: Arc::clone(&adaptive),
        min_batch_size: args.batch.adaptive_min_batch_size,
    }));
    let qos = if args.qos.qos_enabled {
        let engine = QosEngine::new(
            QosEngineConfig {
                evaluation_interval: Duration::from_millis(args.qos.aggregation_interval_ms),
                dry_run: args.qos.qos_dry_run,
            },
            Arc::clone(&aggregator),
            Arc::clone(&executor),
        );
        engine.start();
        Some(engine)
    } else {
        None
    };

    // Regression detection
    let regression = RegressionDetector::new(
        RegressionConfig {
            check_interval: Duration::from_millis(args.qos.regression_check_interval_ms),
            min_samples_for_evaluation: args.qos.regression_min_samples,
            auto_rollback: gantry::qos::AutoRollback {
                enabled: args.qos.auto_rollback_enabled,
                on_critical_only: true,
            },
            ..RegressionConfig::default()
        },
        Arc::clone(&aggregator),
    );
    regression.start();

    // Distributed mode: NATS bus with heartbeat publishing
    let mut bus_tasks = Vec::new();
    if args.distributed {
        let bus_name = cluster
            .as_ref()
            .map(|c| format!("gantry-{}-{}", c.name, args.node_id))
            .unwrap_or_else(|| format!("gantry-{}", args.node_id));
        match BusClient::connect(
            &BusConfig {
                url: args.nats.nats_url.clone(),
                user: args.nats.nats_user.clone(),
                password: args.nats.nats_password.clone(),
            },
            &bus_name,
        )
        .await
        {
            Ok(bus) => {
                let heartbeat_interval = cluster
                    .as_ref()
                    .map(|c| Duration::from_secs(c.heartbeat_interval_secs))
                    .unwrap_or(Duration::from_secs(30));
                let heartbeat_router = Arc::clone(&router);
                let heartbeat_registry = Arc::clone(&registry);
                bus_tasks.push(spawn_heartbeat_publisher(
                    bus,
                    args.node_id.to_string(),
                    heartbeat_interval,
                    move || {
                        (
                            heartbeat_router.active_worker_count(),
                            heartbeat_registry.active_count(),
                        )
                    },
                ));
            }
            Err(e) => {
                warn!(error = %e, "NATS unavailable, continuing single-node");
            }
        }
    }

    // Eager model warmup
    models.warmup().await;

    info!("Gantry ready");

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    info!(
        queues_acquired = generators.queue_pool().acquire_count(),
        queues_released = generators.queue_pool().release_count(),
        streams = registry.stats().completed,
        "Final streaming counters"
    );

    // Orderly teardown: stop intake first, then drain outward-facing
    // components, then the workers themselves.
    for task in bus_tasks {
        task.abort();
    }
    regression.shutdown();
    if let Some(qos) = qos {
        qos.shutdown();
    }
    aggregator.shutdown();
    coordinator.stop_watchdog().await;
    registry.shutdown();
    if let Some(batcher) = batcher {
        batcher.shutdown().await;
    }
    adaptive.shutdown().await;
    models.shutdown();
    if let Some(cache) = prompt_cache {
        cache.shutdown().await;
    }
    pool.shutdown().await;
    manager.shutdown().await;
    if let Some(artifacts) = artifacts {
        artifacts.flush().await;
    }

    info!("Gantry stopped");
    Ok(())
}
