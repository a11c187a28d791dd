//! Generator factory and pooled chunk queues
//!
//! Each generation stream gets a bounded chunk queue (capacity
//! `high_water_mark`) drawn from a reusable pool. Producers await
//! space, so a slow consumer backpressures the pump without chunk
//! loss; order is preserved because one pump task owns the stream.
//!
//! Queue lifecycle: acquired at stream creation, released exactly once
//! on every terminal path. A `released` flag makes double release a
//! no-op, and failed queues are never put back into the pool so a
//! consumer still holding one cannot race a new stream.
//!
//! Chunk contract per stream: tokens in emission order, then one
//! terminal: a metadata chunk carrying stats (synthesized from local
//! timing when the worker omitted them) or an error chunk.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::{CancelToken, StreamEvent, StreamRegistry};
use crate::batch::{BatchMethod, RequestBatcher};
use crate::breaker::BreakerRegistry;
use crate::connection::ConnectionPool;
use crate::rpc::messages::{methods, GenerateParams, Guidance};
use crate::rpc::WorkerLink;
use crate::types::{GantryError, Result};
use crate::worker::RuntimeRouter;

// ============================================================================
// Chunks
// ============================================================================

/// Final statistics for a completed stream
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    pub time_to_first_token_ms: f64,
    pub total_time_ms: f64,
}

/// One element of the generator's output sequence
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratorChunk {
    Token {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logprob: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_final: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cumulative_text: Option<String>,
    },
    Metadata {
        stats: GenerationStats,
    },
    Error {
        error: String,
    },
}

// ============================================================================
// Bounded reusable queue
// ============================================================================

struct QueueInner {
    buf: VecDeque<GeneratorChunk>,
    closed: bool,
    failed: Option<String>,
    failure_delivered: bool,
}

/// Bounded async chunk queue with single-consumer semantics.
pub struct AsyncQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    space: Notify,
    items: Notify,
    released: AtomicBool,
}

impl AsyncQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
                failed: None,
                failure_delivered: false,
            }),
            capacity,
            space: Notify::new(),
            items: Notify::new(),
            released: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Await space, then enqueue. Push chains preserve ordering even if
    /// the consumer pauses, because each push completes before the
    /// producer issues the next.
    pub async fn push(&self, chunk: GeneratorChunk) -> Result<()> {
        loop {
            {
                let mut inner = self.lock();
                if inner.failed.is_some() {
                    return Err(GantryError::Cancelled("queue failed".to_string()));
                }
                if inner.closed {
                    return Err(GantryError::Cancelled("queue closed".to_string()));
                }
                if inner.buf.len() < self.capacity {
                    inner.buf.push_back(chunk);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Dequeue the next chunk; `None` once drained and closed. A failed
    /// queue yields exactly one error chunk before ending.
    pub async fn pop(&self) -> Option<GeneratorChunk> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(chunk) = inner.buf.pop_front() {
                    self.space.notify_one();
                    return Some(chunk);
                }
                if let Some(message) = inner.failed.clone() {
                    if !inner.failure_delivered {
                        inner.failure_delivered = true;
                        return Some(GeneratorChunk::Error { error: message });
                    }
                    return None;
                }
                if inner.closed {
                    return None;
                }
            }
            self.items.notified().await;
        }
    }

    /// No more chunks will arrive; buffered ones stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Terminal failure: drops buffered chunks, the consumer sees one
    /// error chunk. Failed queues are never pooled again.
    pub fn fail(&self, message: &str) {
        {
            let mut inner = self.lock();
            if inner.failed.is_none() {
                inner.failed = Some(message.to_string());
                inner.buf.clear();
            }
        }
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    fn is_failed(&self) -> bool {
        self.lock().failed.is_some()
    }

    fn reset(&self) {
        let mut inner = self.lock();
        inner.buf.clear();
        inner.closed = false;
        inner.failed = None;
        inner.failure_delivered = false;
        self.released.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool of reusable chunk queues
pub struct QueuePool {
    idle: Mutex<Vec<Arc<AsyncQueue>>>,
    queue_capacity: usize,
    max_pooled: usize,
    acquires: AtomicU64,
    releases: AtomicU64,
}

impl QueuePool {
    pub fn new(queue_capacity: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            queue_capacity,
            max_pooled,
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }

    pub fn acquire(&self) -> Arc<AsyncQueue> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match reused {
            Some(queue) => {
                queue.reset();
                queue
            }
            None => AsyncQueue::new(self.queue_capacity),
        }
    }

    /// Return a queue. Double release is a no-op; failed queues are
    /// dropped instead of pooled.
    pub fn release(&self, queue: &Arc<AsyncQueue>) {
        if queue.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        if queue.is_failed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_pooled {
            idle.push(Arc::clone(queue));
        }
    }

    pub fn acquire_count(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn pooled(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Substitute `{{ name }}` placeholders. Both sides are validated: a
/// placeholder without a variable and a variable without a placeholder
/// are errors, as is an unterminated placeholder.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut used: Vec<&str> = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(GantryError::Validation(
                "unterminated '{{' in template".to_string(),
            ));
        };
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(GantryError::Validation(
                "empty placeholder in template".to_string(),
            ));
        }
        let Some(value) = vars.get(name) else {
            return Err(GantryError::Validation(format!(
                "missing template variable '{name}'"
            )));
        };
        out.push_str(value);
        if let Some(key) = vars.keys().find(|k| k.as_str() == name) {
            used.push(key);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    for key in vars.keys() {
        if !used.contains(&key.as_str()) {
            return Err(GantryError::Validation(format!(
                "unused template variable '{key}'"
            )));
        }
    }
    Ok(out)
}

// ============================================================================
// Factory
// ============================================================================

/// Caller-facing generation request (stream id is assigned by the
/// factory unless the options carry one)
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model_id: String,
    pub prompt: String,
    /// Optional prompt template; rendered with `template_vars` and
    /// overriding `prompt` when present
    pub template: Option<String>,
    pub template_vars: Option<HashMap<String, String>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub repetition_penalty: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
    pub stop_token_ids: Option<Vec<u32>>,
    pub seed: Option<u64>,
    pub guidance: Option<Guidance>,
    pub draft_model: Option<String>,
}

/// Request priority, recorded for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct GeneratorOptions {
    pub stream_id: Option<String>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
    pub priority: Priority,
}

/// Per-token and terminal callbacks
#[derive(Clone, Default)]
pub struct TelemetryHooks {
    pub on_token: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_completed: Option<Arc<dyn Fn(&GenerationStats) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct GeneratorFactoryConfig {
    /// Per-stream queue capacity
    pub high_water_mark: usize,
    /// Maximum pooled queues
    pub queue_pool_max: usize,
}

impl Default for GeneratorFactoryConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 64,
            queue_pool_max: 128,
        }
    }
}

pub struct GeneratorFactory {
    config: GeneratorFactoryConfig,
    registry: Arc<StreamRegistry>,
    queues: Arc<QueuePool>,
    router: Arc<RuntimeRouter>,
    pool: Arc<ConnectionPool>,
    batcher: Option<Arc<RequestBatcher>>,
    /// Per-worker breakers gating direct dispatches
    breakers: Option<Arc<BreakerRegistry>>,
    hooks: TelemetryHooks,
}

impl GeneratorFactory {
    pub fn new(
        config: GeneratorFactoryConfig,
        registry: Arc<StreamRegistry>,
        router: Arc<RuntimeRouter>,
        pool: Arc<ConnectionPool>,
        batcher: Option<Arc<RequestBatcher>>,
        breakers: Option<Arc<BreakerRegistry>>,
        hooks: TelemetryHooks,
    ) -> Arc<Self> {
        let queues = QueuePool::new(config.high_water_mark, config.queue_pool_max);
        Arc::new(Self {
            config,
            registry,
            queues,
            router,
            pool,
            batcher,
            breakers,
            hooks,
        })
    }

    pub fn queue_pool(&self) -> &Arc<QueuePool> {
        &self.queues
    }

    /// Create a token stream for one generation request.
    ///
    /// The returned [`TokenStream`] is lazy: dispatch runs in the
    /// background and any dispatch failure surfaces as the stream's
    /// terminal error chunk.
    pub async fn create_generator(
        self: &Arc<Self>,
        mut request: GenerateRequest,
        options: GeneratorOptions,
    ) -> Result<TokenStream> {
        if let Some(template) = request.template.take() {
            let vars = request.template_vars.take().unwrap_or_default();
            request.prompt = render_template(&template, &vars)?;
        }
        if request.model_id.is_empty() {
            return Err(GantryError::Validation("model_id is required".to_string()));
        }

        let stream_id = options
            .stream_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let queue = self.queues.acquire();

        // Route first so sticky sessions bind before any chunk flows
        let worker_id = match self.router.route(Some(&stream_id)) {
            Ok(worker_id) => worker_id,
            Err(e) => {
                self.queues.release(&queue);
                return Err(e);
            }
        };

        let (token, sink_rx) =
            match self
                .registry
                .register(&stream_id, options.cancel.clone(), options.timeout)
            {
                Ok(registered) => registered,
                Err(e) => {
                    self.router.mark_worker_idle(&worker_id);
                    self.queues.release(&queue);
                    return Err(e);
                }
            };

        debug!(
            stream = %stream_id,
            worker = %worker_id,
            model = %request.model_id,
            priority = ?options.priority,
            "Stream created"
        );

        // Pump: registry events → bounded queue, with stats synthesis
        self.spawn_pump(&stream_id, &worker_id, Arc::clone(&queue), sink_rx);

        // Dispatch: generate RPC, direct or through the batcher
        self.spawn_dispatch(&stream_id, &worker_id, request, token.clone(), Arc::clone(&queue));

        Ok(TokenStream {
            stream_id,
            queue,
            queues: Arc::clone(&self.queues),
            registry: Arc::clone(&self.registry),
            done: false,
        })
    }

    fn spawn_pump(
        self: &Arc<Self>,
        stream_id: &str,
        worker_id: &str,
        queue: Arc<AsyncQueue>,
        mut sink_rx: tokio::sync::mpsc::Receiver<StreamEvent>,
    ) {
        let hooks = self.hooks.clone();
        let router = Arc::clone(&self.router);
        let stream_id = stream_id.to_string();
        let worker_id = worker_id.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut first_token: Option<Instant> = None;
            let mut tokens_generated = 0u64;
            let mut reported_stats: Option<GenerationStats> = None;

            loop {
                let Some(event) = sink_rx.recv().await else {
                    // Record evicted without a terminal event: cancelled
                    queue.close();
                    break;
                };
                match event {
                    StreamEvent::Chunk(chunk) => {
                        if first_token.is_none() {
                            first_token = Some(Instant::now());
                        }
                        tokens_generated += 1;
                        if let Some(on_token) = &hooks.on_token {
                            on_token(&chunk.token);
                        }
                        let pushed = queue
                            .push(GeneratorChunk::Token {
                                token: chunk.token,
                                logprob: chunk.logprob,
                                token_id: chunk.token_id,
                                is_final: chunk.is_final,
                                cumulative_text: chunk.cumulative_text,
                            })
                            .await;
                        if pushed.is_err() {
                            break;
                        }
                    }
                    StreamEvent::Stats(stats) => {
                        reported_stats = Some(GenerationStats {
                            tokens_generated: stats.tokens_generated,
                            tokens_per_second: stats.tokens_per_second,
                            time_to_first_token_ms: stats.time_to_first_token,
                            total_time_ms: stats.total_time,
                        });
                    }
                    StreamEvent::Completed => {
                        // Metadata follows all tokens; synthesize stats
                        // from observed timing when the worker sent none
                        let stats = reported_stats.take().unwrap_or_else(|| {
                            synthesize_stats(started, first_token, tokens_generated)
                        });
                        if let Some(on_completed) = &hooks.on_completed {
                            on_completed(&stats);
                        }
                        let _ = queue.push(GeneratorChunk::Metadata { stats }).await;
                        queue.close();
                        break;
                    }
                    StreamEvent::Error(message) => {
                        if let Some(on_error) = &hooks.on_error {
                            on_error(&message);
                        }
                        let _ = queue.push(GeneratorChunk::Error { error: message }).await;
                        queue.close();
                        break;
                    }
                }
            }
            router.mark_worker_idle(&worker_id);
            debug!(stream = %stream_id, tokens = tokens_generated, "Stream pump finished");
        });
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        stream_id: &str,
        worker_id: &str,
        request: GenerateRequest,
        token: CancelToken,
        queue: Arc<AsyncQueue>,
    ) {
        let factory = Arc::clone(self);
        let registry = Arc::clone(&self.registry);
        let queues = Arc::clone(&self.queues);
        let stream_id = stream_id.to_string();
        let worker_id = worker_id.to_string();

        tokio::spawn(async move {
            let params = GenerateParams {
                stream_id: stream_id.clone(),
                model_id: request.model_id.clone(),
                prompt: request.prompt,
                streaming: true,
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                presence_penalty: request.presence_penalty,
                frequency_penalty: request.frequency_penalty,
                repetition_penalty: request.repetition_penalty,
                stop_sequences: request.stop_sequences,
                stop_token_ids: request.stop_token_ids,
                seed: request.seed,
                guidance: request.guidance,
                draft_model: request.draft_model,
            };

            let dispatch = async {
                let wire = serde_json::to_value(&params)?;
                match &factory.batcher {
                    Some(batcher) => {
                        batcher
                            .submit(BatchMethod::Generate, &request.model_id, wire)
                            .await
                    }
                    None => {
                        let conn = factory.pool.acquire(Some(&worker_id)).await?;
                        let call = conn.link.request(methods::GENERATE, wire, None);
                        // The worker's breaker gates direct dispatches
                        let result = match &factory.breakers {
                            Some(breakers) => {
                                breakers.get(&worker_id).execute(move || call).await
                            }
                            None => call.await,
                        };
                        factory.pool.release(&conn).await;
                        result
                    }
                }
            };

            // The abort signal reaches the dispatch too: a cancel while
            // the RPC is in flight stops waiting on it.
            let outcome: Result<Value> = tokio::select! {
                result = dispatch => result,
                _ = token.cancelled() => Err(GantryError::Cancelled("stream cancelled".to_string())),
            };

            if let Err(e) = outcome {
                if !matches!(e, GantryError::Cancelled(_)) {
                    warn!(stream = %stream_id, error = %e, "Generate dispatch failed");
                }
                registry.cancel(&stream_id);
                queue.fail(&format!("dispatch failed: {e}"));
                queues.release(&queue);
            }
        });
    }
}

fn synthesize_stats(
    started: Instant,
    first_token: Option<Instant>,
    tokens_generated: u64,
) -> GenerationStats {
    let total_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    let time_to_first_token_ms = first_token
        .map(|t| t.duration_since(started).as_secs_f64() * 1000.0)
        .unwrap_or(0.0);
    let seconds = (total_time_ms / 1000.0).max(f64::EPSILON);
    GenerationStats {
        tokens_generated,
        tokens_per_second: tokens_generated as f64 / seconds,
        time_to_first_token_ms,
        total_time_ms,
    }
}

// ============================================================================
// Token stream
// ============================================================================

/// Lazy finite sequence of generator chunks.
///
/// Terminal contract: exactly one of a metadata chunk (after all
/// tokens) or an error chunk is observed, after which `next` returns
/// `None`. The underlying queue is released on every terminal path.
pub struct TokenStream {
    stream_id: String,
    queue: Arc<AsyncQueue>,
    queues: Arc<QueuePool>,
    registry: Arc<StreamRegistry>,
    done: bool,
}

impl TokenStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next chunk, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<GeneratorChunk> {
        if self.done {
            return None;
        }
        match self.queue.pop().await {
            Some(chunk) => Some(chunk),
            None => {
                self.done = true;
                self.queues.release(&self.queue);
                None
            }
        }
    }

    /// Consumer abort: cancel the stream if still active, release the
    /// queue. No further chunks are yielded.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.registry.cancel(&self.stream_id);
        self.queue.fail("cancelled by consumer");
        self.queues.release(&self.queue);
    }

    /// Consumer-side failure injection: fail the queue and release it.
    pub fn fail(&mut self, reason: &str) {
        if self.done {
            return;
        }
        self.done = true;
        self.registry.cancel(&self.stream_id);
        self.queue.fail(reason);
        self.queues.release(&self.queue);
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.done {
            self.registry.cancel(&self.stream_id);
            self.queue.fail("stream dropped");
            self.queues.release(&self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, ConnectionPoolConfig};
    use crate::rpc::messages::notifications;
    use crate::rpc::testing::MockWorkerLink;
    use crate::rpc::WorkerLink;
    use crate::stream::registry::StreamRegistryConfig;
    use crate::worker::{RoutingStrategy, WorkerStatus};
    use async_trait::async_trait;
    use serde_json::json;

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

    struct Rig {
        link: Arc<MockWorkerLink>,
        registry: Arc<StreamRegistry>,
        router: Arc<RuntimeRouter>,
        factory: Arc<GeneratorFactory>,
    }

    async fn rig_with(high_water_mark: usize, hooks: TelemetryHooks) -> Rig {
        let link = Arc::new(MockWorkerLink::ok());
        let registry = StreamRegistry::new(StreamRegistryConfig::default());
        registry.attach_worker(&(Arc::clone(&link) as Arc<dyn WorkerLink>));

        let router = Arc::new(RuntimeRouter::new(RoutingStrategy::RoundRobin));
        router.register("worker-0", WorkerStatus::Idle);

        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                warmup_on_start: false,
                health_check_interval: Duration::from_secs(3600),
                ..ConnectionPoolConfig::default()
            },
            Arc::new(SharedLinkFactory {
                link: Arc::clone(&link),
            }),
        );
        pool.start().await.unwrap();

        let factory = GeneratorFactory::new(
            GeneratorFactoryConfig {
                high_water_mark,
                queue_pool_max: 128,
            },
            Arc::clone(&registry),
            Arc::clone(&router),
            pool,
            None,
            None,
            hooks,
        );
        Rig {
            link,
            registry,
            router,
            factory,
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            model_id: "m1".to_string(),
            prompt: "hello".to_string(),
            max_tokens: Some(16),
            ..GenerateRequest::default()
        }
    }

    fn options(stream_id: &str) -> GeneratorOptions {
        GeneratorOptions {
            stream_id: Some(stream_id.to_string()),
            ..GeneratorOptions::default()
        }
    }

    fn push_token(link: &MockWorkerLink, stream_id: &str, token: &str) {
        link.push_notification(
            notifications::STREAM_CHUNK,
            json!({"stream_id": stream_id, "token": token}),
        );
    }

    fn push_completed(link: &MockWorkerLink, stream_id: &str) {
        link.push_notification(
            notifications::STREAM_COMPLETED,
            json!({"stream_id": stream_id}),
        );
    }

    #[tokio::test]
    async fn test_tokens_then_synthesized_metadata() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        for token in ["a", "b", "c"] {
            push_token(&rig.link, "s1", token);
        }
        push_completed(&rig.link, "s1");

        let mut tokens = Vec::new();
        let mut stats = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                GeneratorChunk::Token { token, .. } => tokens.push(token),
                GeneratorChunk::Metadata { stats: s } => stats = Some(s),
                GeneratorChunk::Error { error } => panic!("unexpected error: {error}"),
            }
        }
        assert_eq!(tokens, vec!["a", "b", "c"]);
        let stats = stats.expect("metadata chunk after tokens");
        assert_eq!(stats.tokens_generated, 3);
        assert!(stats.total_time_ms >= 0.0);

        // Queue returned exactly once
        assert_eq!(rig.factory.queue_pool().acquire_count(), 1);
        assert_eq!(rig.factory.queue_pool().release_count(), 1);
        // Worker accounting returned to idle
        assert_eq!(rig.router.active_requests("worker-0"), 0);
    }

    #[tokio::test]
    async fn test_worker_stats_pass_through() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        push_token(&rig.link, "s1", "x");
        rig.link.push_notification(
            notifications::STREAM_STATS,
            json!({
                "stream_id": "s1",
                "tokens_generated": 1,
                "tokens_per_second": 42.0,
                "time_to_first_token": 5.0,
                "total_time": 24.0
            }),
        );
        push_completed(&rig.link, "s1");

        let mut stats = None;
        while let Some(chunk) = stream.next().await {
            if let GeneratorChunk::Metadata { stats: s } = chunk {
                stats = Some(s);
            }
        }
        let stats = stats.unwrap();
        assert_eq!(stats.tokens_per_second, 42.0);
        assert_eq!(stats.total_time_ms, 24.0);
    }

    #[tokio::test]
    async fn test_backpressure_bounded_queue_no_loss() {
        let rig = rig_with(2, TelemetryHooks::default()).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expected: Vec<String> = (0..100).map(|i| format!("t{i}")).collect();
        for token in &expected {
            push_token(&rig.link, "s1", token);
        }
        push_completed(&rig.link, "s1");

        let queue = Arc::clone(&stream.queue);
        let mut received = Vec::new();
        let mut max_buffered = 0usize;
        loop {
            max_buffered = max_buffered.max(queue.len());
            let Some(chunk) = stream.next().await else { break };
            if let GeneratorChunk::Token { token, .. } = chunk {
                received.push(token);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(received, expected);
        assert!(max_buffered <= 2, "queue grew to {max_buffered}");
    }

    #[tokio::test]
    async fn test_worker_error_is_terminal_chunk() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        push_token(&rig.link, "s1", "x");
        rig.link.push_notification(
            notifications::STREAM_ERROR,
            json!({"stream_id": "s1", "message": "kv cache overflow"}),
        );

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0], GeneratorChunk::Token { .. }));
        match &chunks[1] {
            GeneratorChunk::Error { error } => assert_eq!(error, "kv cache overflow"),
            other => panic!("expected error chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_failure_surfaces_and_releases_once() {
        let link = Arc::new(MockWorkerLink::new(|method, _| {
            if method == methods::GENERATE {
                Err(GantryError::Runtime("worker refused".to_string()))
            } else {
                Ok(Value::Null)
            }
        }));
        let registry = StreamRegistry::new(StreamRegistryConfig::default());
        registry.attach_worker(&(Arc::clone(&link) as Arc<dyn WorkerLink>));
        let router = Arc::new(RuntimeRouter::new(RoutingStrategy::RoundRobin));
        router.register("worker-0", WorkerStatus::Idle);
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                warmup_on_start: false,
                health_check_interval: Duration::from_secs(3600),
                ..ConnectionPoolConfig::default()
            },
            Arc::new(SharedLinkFactory {
                link: Arc::clone(&link),
            }),
        );
        pool.start().await.unwrap();
        let factory = GeneratorFactory::new(
            GeneratorFactoryConfig::default(),
            Arc::clone(&registry),
            router,
            pool,
            None,
            None,
            TelemetryHooks::default(),
        );

        let mut stream = factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            GeneratorChunk::Error { error } => assert!(error.contains("dispatch failed")),
            other => panic!("expected dispatch error, got {other:?}"),
        }
        assert!(!registry.is_active("s1"));
        assert_eq!(factory.queue_pool().acquire_count(), 1);
        assert_eq!(factory.queue_pool().release_count(), 1);
    }

    #[tokio::test]
    async fn test_consumer_cancel_stops_stream() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.registry.is_active("s1"));

        stream.cancel();
        assert!(!rig.registry.is_active("s1"));
        assert_eq!(rig.factory.queue_pool().release_count(), 1);
        assert!(stream.next().await.is_none());

        // Late chunks are dropped silently
        push_token(&rig.link, "s1", "late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_queue() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        {
            let _stream = rig
                .factory
                .create_generator(request(), options("s1"))
                .await
                .unwrap();
        }
        assert_eq!(rig.factory.queue_pool().acquire_count(), 1);
        assert_eq!(rig.factory.queue_pool().release_count(), 1);
        assert!(!rig.registry.is_active("s1"));
    }

    #[tokio::test]
    async fn test_telemetry_hooks_fire() {
        let token_count = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicBool::new(false));
        let hooks = TelemetryHooks {
            on_token: Some({
                let count = Arc::clone(&token_count);
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::Relaxed);
                })
            }),
            on_completed: Some({
                let flag = Arc::clone(&completed);
                Arc::new(move |_| {
                    flag.store(true, Ordering::Release);
                })
            }),
            on_error: None,
        };

        let rig = rig_with(64, hooks).await;
        let mut stream = rig
            .factory
            .create_generator(request(), options("s1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        push_token(&rig.link, "s1", "a");
        push_token(&rig.link, "s1", "b");
        push_completed(&rig.link, "s1");
        while stream.next().await.is_some() {}

        assert_eq!(token_count.load(Ordering::Relaxed), 2);
        assert!(completed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_queue_reuse_across_streams() {
        let rig = rig_with(64, TelemetryHooks::default()).await;
        for i in 0..3 {
            let stream_id = format!("s{i}");
            let mut stream = rig
                .factory
                .create_generator(request(), options(&stream_id))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            push_token(&rig.link, &stream_id, "x");
            push_completed(&rig.link, &stream_id);
            while stream.next().await.is_some() {}
        }
        assert_eq!(rig.factory.queue_pool().acquire_count(), 3);
        assert_eq!(rig.factory.queue_pool().release_count(), 3);
        // Clean streams return their queue to the pool
        assert_eq!(rig.factory.queue_pool().pooled(), 1);
    }

    #[test]
    fn test_render_template() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "world".to_string());
        assert_eq!(
            render_template("hello {{ name }}!", &vars).unwrap(),
            "hello world!"
        );

        // Missing variable
        assert!(render_template("{{ missing }}", &HashMap::new()).is_err());
        // Unused variable
        assert!(render_template("static", &vars).is_err());
        // Unterminated placeholder
        assert!(render_template("{{ name", &vars).is_err());
        // Empty placeholder
        assert!(render_template("{{ }}", &vars).is_err());
    }
}
