//! Request batcher and adaptive batch-size controller
//!
//! Coalesces small fan-in calls (tokenize, check_draft, generate) into
//! `batch_<method>` RPCs, amortizing per-call overhead. Queues are per
//! (method, model). A batch flushes when it reaches the size limit,
//! when the head entry's deadline passes, or on explicit flush. The
//! worker answers with positional results; one failed position settles
//! its own caller and never poisons the rest.
//!
//! The optional adaptive controller feeds latency/size averages to the
//! worker's adaptive component and applies clamped size
//! recommendations coming back as notifications.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionPool;
use crate::rpc::messages::{
    methods, notifications, AdaptiveRecommendation, AdaptiveUpdateParams, BatchItem,
    BatchResults,
};
use crate::rpc::WorkerLink;
use crate::types::{GantryError, Result};

/// Batchable methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchMethod {
    Tokenize,
    CheckDraft,
    Generate,
}

impl BatchMethod {
    pub fn rpc_method(&self) -> &'static str {
        match self {
            BatchMethod::Tokenize => methods::BATCH_TOKENIZE,
            BatchMethod::CheckDraft => methods::BATCH_CHECK_DRAFT,
            BatchMethod::Generate => methods::BATCH_GENERATE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    /// Head-of-queue deadline; also the flush scan cadence
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 8,
            flush_interval: Duration::from_millis(10),
        }
    }
}

struct PendingCall {
    request: Value,
    resolver: oneshot::Sender<Result<Value>>,
    deadline: Instant,
}

type QueueKey = (BatchMethod, String);

#[derive(Debug, Clone, Default)]
pub struct BatcherStats {
    pub batches_sent: u64,
    pub requests_batched: u64,
    pub avg_batch_size: f64,
}

pub struct RequestBatcher {
    config: BatcherConfig,
    pool: Arc<ConnectionPool>,
    adaptive: Option<Arc<AdaptiveController>>,
    queues: Mutex<HashMap<QueueKey, VecDeque<PendingCall>>>,
    batches_sent: AtomicU64,
    requests_batched: AtomicU64,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestBatcher {
    pub fn new(
        config: BatcherConfig,
        pool: Arc<ConnectionPool>,
        adaptive: Option<Arc<AdaptiveController>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            adaptive,
            queues: Mutex::new(HashMap::new()),
            batches_sent: AtomicU64::new(0),
            requests_batched: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the deadline flusher.
    pub async fn start(self: &Arc<Self>) {
        let batcher = Arc::clone(self);
        let cadence = (self.config.flush_interval / 2).max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if batcher.shutdown.load(Ordering::Acquire) {
                    break;
                }
                batcher.flush_expired().await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    fn effective_batch_size(&self) -> usize {
        self.adaptive
            .as_ref()
            .map(|a| a.current_size())
            .unwrap_or(self.config.max_batch_size)
            .max(1)
    }

    /// Enqueue one call and await its positional result.
    pub async fn submit(
        self: &Arc<Self>,
        method: BatchMethod,
        model_id: &str,
        request: Value,
    ) -> Result<Value> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(GantryError::Shutdown("batcher closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let key = (method, model_id.to_string());
        let flush_now = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(key.clone()).or_default();
            queue.push_back(PendingCall {
                request,
                resolver: tx,
                deadline: Instant::now() + self.config.flush_interval,
            });
            queue.len() >= self.effective_batch_size()
        };

        if flush_now {
            self.flush_key(&key).await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GantryError::Shutdown("batcher closed".to_string())),
        }
    }

    /// Flush queues whose head entry's deadline has passed.
    async fn flush_expired(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<QueueKey> = {
            let queues = self.queues.lock().await;
            queues
                .iter()
                .filter(|(_, q)| q.front().map(|c| c.deadline <= now).unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in expired {
            self.flush_key(&key).await;
        }
    }

    /// Flush everything immediately.
    pub async fn flush_all(self: &Arc<Self>) {
        let keys: Vec<QueueKey> = {
            let queues = self.queues.lock().await;
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in keys {
            self.flush_key(&key).await;
        }
    }

    async fn flush_key(self: &Arc<Self>, key: &QueueKey) {
        let batch: Vec<PendingCall> = {
            let mut queues = self.queues.lock().await;
            let Some(queue) = queues.get_mut(key) else { return };
            let take = queue.len().min(self.effective_batch_size());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        let batcher = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            batcher.dispatch(&key, batch).await;
        });
    }

    /// Issue the batched RPC and settle each caller by position.
    async fn dispatch(self: &Arc<Self>, key: &QueueKey, batch: Vec<PendingCall>) {
        let size = batch.len();
        let envelope = json!({
            "requests": batch.iter().map(|c| c.request.clone()).collect::<Vec<_>>(),
        });
        debug!(method = key.0.rpc_method(), model = %key.1, size, "Dispatching batch");

        let started = Instant::now();
        let outcome = async {
            let conn = self.pool.acquire(None).await?;
            let result = conn
                .link
                .request(key.0.rpc_method(), envelope, None)
                .await;
            self.pool.release(&conn).await;
            result
        }
        .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.requests_batched.fetch_add(size as u64, Ordering::Relaxed);
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_sample(latency_ms, size);
        }

        match outcome {
            Ok(raw) => {
                let parsed: std::result::Result<BatchResults, _> = serde_json::from_value(raw);
                match parsed {
                    Ok(results) if results.results.len() == size => {
                        for (call, item) in batch.into_iter().zip(results.results) {
                            let _ = call.resolver.send(settle_item(item));
                        }
                    }
                    Ok(results) => {
                        warn!(
                            expected = size,
                            got = results.results.len(),
                            "Batch response length mismatch"
                        );
                        for call in batch {
                            let _ = call.resolver.send(Err(GantryError::Runtime(
                                "batch response length mismatch".to_string(),
                            )));
                        }
                    }
                    Err(e) => {
                        for call in batch {
                            let _ = call.resolver.send(Err(GantryError::Runtime(format!(
                                "malformed batch response: {e}"
                            ))));
                        }
                    }
                }
            }
            Err(e) => {
                // The whole RPC failed: every caller gets its own error
                let message = e.to_string();
                for call in batch {
                    let _ = call
                        .resolver
                        .send(Err(GantryError::Runtime(message.clone())));
                }
            }
        }
    }

    pub fn stats(&self) -> BatcherStats {
        let batches = self.batches_sent.load(Ordering::Relaxed);
        let requests = self.requests_batched.load(Ordering::Relaxed);
        BatcherStats {
            batches_sent: batches,
            requests_batched: requests,
            avg_batch_size: if batches == 0 {
                0.0
            } else {
                requests as f64 / batches as f64
            },
        }
    }

    /// Idempotent shutdown: flush what is queued, stop the flusher.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_all().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Request batcher shut down");
    }
}

/// One positional result becomes one caller's outcome.
fn settle_item(item: BatchItem) -> Result<Value> {
    if item.success {
        Ok(item.result.unwrap_or(Value::Null))
    } else {
        Err(GantryError::Runtime(
            item.error.unwrap_or_else(|| "batch item failed".to_string()),
        ))
    }
}

// ============================================================================
// Adaptive controller
// ============================================================================

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub default_batch_size: usize,
    pub update_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_batch_size: 1,
            max_batch_size: 32,
            default_batch_size: 8,
            update_interval: Duration::from_secs(5),
        }
    }
}

/// Tracks latency feedback and applies worker recommendations.
pub struct AdaptiveController {
    config: AdaptiveConfig,
    pool: Arc<ConnectionPool>,
    current: AtomicUsize,
    adjustment_count: AtomicU64,
    samples: std::sync::Mutex<Vec<(f64, usize)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, pool: Arc<ConnectionPool>) -> Arc<Self> {
        let initial = config.default_batch_size;
        Arc::new(Self {
            config,
            pool,
            current: AtomicUsize::new(initial),
            adjustment_count: AtomicU64::new(0),
            samples: std::sync::Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn current_size(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn adjustment_count(&self) -> u64 {
        self.adjustment_count.load(Ordering::Relaxed)
    }

    pub fn record_sample(&self, latency_ms: f64, batch_size: usize) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((latency_ms, batch_size));
    }

    /// Apply a recommendation, clamped into the configured bounds.
    pub fn apply_recommendation(&self, recommendation: &AdaptiveRecommendation) {
        let clamped = recommendation
            .recommended_size
            .clamp(self.config.min_batch_size, self.config.max_batch_size);
        let previous = self.current.swap(clamped, Ordering::AcqRel);
        if previous != clamped {
            self.adjustment_count.fetch_add(1, Ordering::Relaxed);
            info!(
                previous,
                next = clamped,
                reason = recommendation.reason.as_deref().unwrap_or("unspecified"),
                "Adaptive batch size adjusted"
            );
        }
    }

    /// Listen for worker recommendations on a link's notifications.
    pub async fn attach_worker(self: &Arc<Self>, link: &Arc<dyn WorkerLink>) {
        let mut rx = link.subscribe();
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        if notification.method == notifications::ADAPTIVE_RECOMMENDATION {
                            match serde_json::from_value::<AdaptiveRecommendation>(
                                notification.params.clone(),
                            ) {
                                Ok(recommendation) => {
                                    controller.apply_recommendation(&recommendation)
                                }
                                Err(e) => {
                                    warn!(error = %e, "Malformed adaptive recommendation")
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Periodically report window averages to the worker's adaptive
    /// component; fall back to the default size when unreachable.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.update_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.report_window().await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    async fn report_window(self: &Arc<Self>) {
        let window: Vec<(f64, usize)> = {
            let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *samples)
        };
        if window.is_empty() {
            return;
        }
        let count = window.len();
        let avg_latency_ms = window.iter().map(|(l, _)| *l).sum::<f64>() / count as f64;
        let avg_batch_size =
            window.iter().map(|(_, s)| *s as f64).sum::<f64>() / count as f64;

        let update = AdaptiveUpdateParams {
            avg_latency_ms,
            avg_batch_size,
            sample_count: count,
        };
        let sent = async {
            let conn = self.pool.acquire(None).await?;
            let result = conn
                .link
                .notify(methods::ADAPTIVE_UPDATE, serde_json::to_value(&update)?)
                .await;
            self.pool.release(&conn).await;
            result
        }
        .await;

        if let Err(e) = sent {
            warn!(error = %e, "Adaptive component unreachable, reverting to default size");
            self.current
                .store(self.config.default_batch_size, Ordering::Release);
        }
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, ConnectionPoolConfig};
    use crate::rpc::testing::MockWorkerLink;
    use async_trait::async_trait;

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

    async fn pool_for(link: Arc<MockWorkerLink>) -> Arc<ConnectionPool> {
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                warmup_on_start: false,
                health_check_interval: Duration::from_secs(3600),
                ..ConnectionPoolConfig::default()
            },
            Arc::new(SharedLinkFactory { link }),
        );
        pool.start().await.unwrap();
        pool
    }

    /// Echoes every batched request back as its own result
    fn echo_link() -> Arc<MockWorkerLink> {
        Arc::new(MockWorkerLink::new(|_, params| {
            let requests = params["requests"].as_array().cloned().unwrap_or_default();
            let results: Vec<Value> = requests
                .iter()
                .map(|r| json!({"success": true, "result": r}))
                .collect();
            Ok(json!({ "results": results }))
        }))
    }

    #[tokio::test]
    async fn test_size_triggered_flush_pairs_by_index() {
        let link = echo_link();
        let pool = pool_for(Arc::clone(&link)).await;
        let batcher = RequestBatcher::new(
            BatcherConfig {
                max_batch_size: 3,
                flush_interval: Duration::from_secs(10),
                ..BatcherConfig::default()
            },
            pool,
            None,
        );
        batcher.start().await;

        let submissions: Vec<_> = (0..3)
            .map(|i| {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move {
                    batcher
                        .submit(BatchMethod::Tokenize, "m1", json!({"text": format!("t{i}")}))
                        .await
                })
            })
            .collect();
        let results: Vec<Value> = futures::future::join_all(submissions)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        // Each caller got its own request back
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result["text"], format!("t{i}"));
        }
        assert_eq!(link.call_count(methods::BATCH_TOKENIZE), 1);
        assert_eq!(batcher.stats().batches_sent, 1);
        assert_eq!(batcher.stats().requests_batched, 3);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_triggered_flush() {
        let link = echo_link();
        let pool = pool_for(Arc::clone(&link)).await;
        let batcher = RequestBatcher::new(
            BatcherConfig {
                max_batch_size: 100,
                flush_interval: Duration::from_millis(20),
                ..BatcherConfig::default()
            },
            pool,
            None,
        );
        batcher.start().await;

        let result = batcher
            .submit(BatchMethod::Tokenize, "m1", json!({"text": "solo"}))
            .await
            .unwrap();
        assert_eq!(result["text"], "solo");
        assert_eq!(batcher.stats().batches_sent, 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_position_does_not_poison_batch() {
        let link = Arc::new(MockWorkerLink::new(|_, params| {
            let requests = params["requests"].as_array().cloned().unwrap_or_default();
            let results: Vec<Value> = requests
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    if i == 1 {
                        json!({"success": false, "error": "bad position"})
                    } else {
                        json!({"success": true, "result": r})
                    }
                })
                .collect();
            Ok(json!({ "results": results }))
        }));
        let pool = pool_for(Arc::clone(&link)).await;
        let batcher = RequestBatcher::new(
            BatcherConfig {
                max_batch_size: 3,
                flush_interval: Duration::from_secs(10),
                ..BatcherConfig::default()
            },
            pool,
            None,
        );
        batcher.start().await;

        let submissions: Vec<_> = (0..3)
            .map(|i| {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move {
                    batcher
                        .submit(BatchMethod::CheckDraft, "m1", json!({"i": i}))
                        .await
                })
            })
            .collect();
        let results: Vec<Result<Value>> = futures::future::join_all(submissions)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(results[0].is_ok());
        assert!(results[2].is_ok());
        match &results[1] {
            Err(GantryError::Runtime(message)) => assert!(message.contains("bad position")),
            other => panic!("expected runtime error, got {other:?}"),
        }
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_failure_fails_all_callers() {
        let link = Arc::new(MockWorkerLink::new(|_, _| {
            Err(GantryError::Runtime("worker gone".to_string()))
        }));
        let pool = pool_for(Arc::clone(&link)).await;
        let batcher = RequestBatcher::new(
            BatcherConfig {
                max_batch_size: 2,
                flush_interval: Duration::from_secs(10),
                ..BatcherConfig::default()
            },
            pool,
            None,
        );
        batcher.start().await;

        let submissions: Vec<_> = (0..2)
            .map(|i| {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move {
                    batcher
                        .submit(BatchMethod::Tokenize, "m1", json!({"i": i}))
                        .await
                })
            })
            .collect();
        for result in futures::future::join_all(submissions).await {
            assert!(result.unwrap().is_err());
        }
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_batch() {
        let link = Arc::new(MockWorkerLink::new(|_, _| {
            Ok(json!({"results": [{"success": true, "result": {}}]}))
        }));
        let pool = pool_for(Arc::clone(&link)).await;
        let batcher = RequestBatcher::new(
            BatcherConfig {
                max_batch_size: 2,
                flush_interval: Duration::from_secs(10),
                ..BatcherConfig::default()
            },
            pool,
            None,
        );
        batcher.start().await;

        let submissions: Vec<_> = (0..2)
            .map(|i| {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move {
                    batcher
                        .submit(BatchMethod::Tokenize, "m1", json!({"i": i}))
                        .await
                })
            })
            .collect();
        for result in futures::future::join_all(submissions).await {
            let err = result.unwrap().unwrap_err();
            assert!(err.to_string().contains("length mismatch"));
        }
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_adaptive_recommendation_clamped_and_counted() {
        let link = echo_link();
        let pool = pool_for(Arc::clone(&link)).await;
        let controller = AdaptiveController::new(
            AdaptiveConfig {
                enabled: true,
                min_batch_size: 2,
                max_batch_size: 16,
                default_batch_size: 8,
                update_interval: Duration::from_secs(60),
            },
            pool,
        );
        assert_eq!(controller.current_size(), 8);

        controller.apply_recommendation(&AdaptiveRecommendation {
            recommended_size: 64,
            current_size: 8,
            ema_latency: Some(12.5),
            reason: Some("low latency".to_string()),
        });
        assert_eq!(controller.current_size(), 16);
        assert_eq!(controller.adjustment_count(), 1);

        controller.apply_recommendation(&AdaptiveRecommendation {
            recommended_size: 1,
            current_size: 16,
            ema_latency: None,
            reason: None,
        });
        assert_eq!(controller.current_size(), 2);
        assert_eq!(controller.adjustment_count(), 2);
    }

    #[tokio::test]
    async fn test_adaptive_notifications_from_worker() {
        let link = echo_link();
        let pool = pool_for(Arc::clone(&link)).await;
        let controller = AdaptiveController::new(
            AdaptiveConfig {
                enabled: true,
                ..AdaptiveConfig::default()
            },
            pool,
        );
        controller
            .attach_worker(&(Arc::clone(&link) as Arc<dyn WorkerLink>))
            .await;

        link.push_notification(
            notifications::ADAPTIVE_RECOMMENDATION,
            json!({"recommended_size": 4, "current_size": 8}),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.current_size(), 4);
        controller.shutdown().await;
    }
}
