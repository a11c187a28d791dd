//! Stream registry
//!
//! One record per in-flight generation stream. The registry
//! demultiplexes worker notifications (`stream.chunk`, `stream.stats`,
//! `stream.completed`, `stream.error`) by `stream_id` onto the
//! stream's event sink, enforces deadlines with per-stream timers, and
//! guarantees exactly one terminal outcome per stream: completion,
//! error, timeout or cancellation. Double completion is rejected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rpc::messages::{
    notifications, Notification, StreamChunkPayload, StreamErrorPayload, StreamStatsPayload,
};
use crate::rpc::WorkerLink;
use crate::types::{GantryError, Result};

/// Sink capacity between the demux and a stream's pump
const SINK_CAPACITY: usize = 256;

/// Cancellation token shared between caller, registry and generator.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Events delivered to a stream's sink, in worker-emission order
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunkPayload),
    Stats(StreamStatsPayload),
    Completed,
    Error(String),
}

/// How a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Errored,
    TimedOut,
    Cancelled,
}

struct StreamRecord {
    cancel: CancelToken,
    deadline: Option<Instant>,
    sink: mpsc::Sender<StreamEvent>,
    deadline_task: Option<JoinHandle<()>>,
    cancel_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct StreamRegistryConfig {
    pub default_timeout: Duration,
    pub max_active_streams: usize,
    pub cleanup_interval: Duration,
}

impl Default for StreamRegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            max_active_streams: 256,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Terminal-outcome counters
#[derive(Debug, Clone, Default)]
pub struct StreamRegistryStats {
    pub active: usize,
    pub completed: u64,
    pub errored: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected_duplicates: u64,
}

pub struct StreamRegistry {
    config: StreamRegistryConfig,
    streams: DashMap<String, StreamRecord>,
    completed: AtomicU64,
    errored: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected_duplicates: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamRegistry {
    pub fn new(config: StreamRegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            streams: DashMap::new(),
            completed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            rejected_duplicates: AtomicU64::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Create the event sink and register a stream. Returns the cancel
    /// token (the caller's, if one was provided) and the sink receiver.
    pub fn register(
        self: &Arc<Self>,
        stream_id: &str,
        cancel: Option<CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<(CancelToken, mpsc::Receiver<StreamEvent>)> {
        if self.streams.len() >= self.config.max_active_streams {
            return Err(GantryError::PoolExhausted(format!(
                "max active streams reached ({})",
                self.config.max_active_streams
            )));
        }
        if self.streams.contains_key(stream_id) {
            return Err(GantryError::Validation(format!(
                "stream {stream_id} already registered"
            )));
        }

        let token = cancel.unwrap_or_default();
        let budget = timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + budget;
        let (sink_tx, sink_rx) = mpsc::channel(SINK_CAPACITY);

        // Deadline timer converts expiry into a stream-level error
        let deadline_task = {
            let registry = Arc::clone(self);
            let stream_id = stream_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                if let Some(record) = registry.finish(&stream_id, Terminal::TimedOut, false) {
                    warn!(stream = %stream_id, "Stream deadline exceeded");
                    let _ = record
                        .sink
                        .send(StreamEvent::Error(format!(
                            "stream timed out after {}ms",
                            budget.as_millis()
                        )))
                        .await;
                    record.cancel.cancel();
                }
            })
        };

        // Cancellation wiring: an externally triggered token evicts the
        // record; the sink closing tells the generator to stop.
        let cancel_task = {
            let registry = Arc::clone(self);
            let stream_id = stream_id.to_string();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                registry.cancel(&stream_id);
            })
        };

        self.streams.insert(
            stream_id.to_string(),
            StreamRecord {
                cancel: token.clone(),
                deadline: Some(deadline),
                sink: sink_tx,
                deadline_task: Some(deadline_task),
                cancel_task: Some(cancel_task),
            },
        );
        debug!(stream = %stream_id, timeout_ms = budget.as_millis() as u64, "Stream registered");
        Ok((token, sink_rx))
    }

    /// Route one worker notification to its stream. Returns false when
    /// the notification did not match an active stream.
    pub async fn dispatch(&self, notification: &Notification) -> bool {
        let Some(stream_id) = notification.stream_id().map(str::to_string) else {
            return false;
        };

        match notification.method.as_str() {
            notifications::STREAM_CHUNK => {
                let Ok(payload) =
                    serde_json::from_value::<StreamChunkPayload>(notification.params.clone())
                else {
                    warn!(stream = %stream_id, "Malformed stream.chunk payload");
                    return false;
                };
                self.forward(&stream_id, StreamEvent::Chunk(payload)).await
            }
            notifications::STREAM_STATS => {
                let Ok(payload) =
                    serde_json::from_value::<StreamStatsPayload>(notification.params.clone())
                else {
                    warn!(stream = %stream_id, "Malformed stream.stats payload");
                    return false;
                };
                self.forward(&stream_id, StreamEvent::Stats(payload)).await
            }
            notifications::STREAM_COMPLETED => {
                match self.finish(&stream_id, Terminal::Completed, true) {
                    Some(record) => {
                        let _ = record.sink.send(StreamEvent::Completed).await;
                        true
                    }
                    None => {
                        self.rejected_duplicates.fetch_add(1, Ordering::Relaxed);
                        warn!(stream = %stream_id, "Completion for unknown or finished stream");
                        false
                    }
                }
            }
            notifications::STREAM_ERROR => {
                let message = serde_json::from_value::<StreamErrorPayload>(
                    notification.params.clone(),
                )
                .map(|p| p.message)
                .unwrap_or_else(|_| "worker stream error".to_string());
                match self.finish(&stream_id, Terminal::Errored, true) {
                    Some(record) => {
                        let _ = record.sink.send(StreamEvent::Error(message)).await;
                        true
                    }
                    None => {
                        self.rejected_duplicates.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
            }
            _ => false,
        }
    }

    async fn forward(&self, stream_id: &str, event: StreamEvent) -> bool {
        let sink = match self.streams.get(stream_id) {
            Some(record) => record.sink.clone(),
            None => {
                debug!(stream = %stream_id, "Chunk for unknown stream (dropped)");
                return false;
            }
        };
        sink.send(event).await.is_ok()
    }

    /// Cancel a stream. Returns false when it was not active.
    pub fn cancel(&self, stream_id: &str) -> bool {
        match self.finish(stream_id, Terminal::Cancelled, true) {
            Some(record) => {
                record.cancel.cancel();
                debug!(stream = %stream_id, "Stream cancelled");
                true
            }
            None => false,
        }
    }

    /// Single linearization point for stream teardown: whoever removes
    /// the record owns the terminal event. `abort_timer` is false when
    /// the deadline task itself is the caller.
    fn finish(&self, stream_id: &str, terminal: Terminal, abort_timer: bool) -> Option<StreamRecord> {
        let (_, record) = self.streams.remove(stream_id)?;
        if abort_timer {
            if let Some(task) = &record.deadline_task {
                task.abort();
            }
        }
        if let Some(task) = &record.cancel_task {
            if terminal != Terminal::Cancelled {
                task.abort();
            }
        }
        let counter = match terminal {
            Terminal::Completed => &self.completed,
            Terminal::Errored => &self.errored,
            Terminal::TimedOut => &self.timed_out,
            Terminal::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    pub fn is_active(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stats(&self) -> StreamRegistryStats {
        StreamRegistryStats {
            active: self.streams.len(),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected_duplicates: self.rejected_duplicates.load(Ordering::Relaxed),
        }
    }

    /// Attach a worker: its stream notifications are demultiplexed into
    /// this registry until the worker goes away.
    pub fn attach_worker(self: &Arc<Self>, link: &Arc<dyn WorkerLink>) {
        let mut rx = link.subscribe();
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        if notification.method.starts_with("stream.") {
                            registry.dispatch(notification.as_ref()).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stream demux lagged behind worker notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Belt-and-braces sweep for records whose deadline task was lost.
    pub fn start_cleanup(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<String> = registry
                    .streams
                    .iter()
                    .filter(|r| r.deadline.map(|d| d < now).unwrap_or(false))
                    .map(|r| r.key().clone())
                    .collect();
                for stream_id in expired {
                    if let Some(record) = registry.finish(&stream_id, Terminal::TimedOut, true) {
                        let _ = record
                            .sink
                            .send(StreamEvent::Error("stream timed out".to_string()))
                            .await;
                        record.cancel.cancel();
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Idempotent shutdown: cancel timers and evict every stream.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let ids: Vec<String> = self.streams.iter().map(|r| r.key().clone()).collect();
        for stream_id in ids {
            self.cancel(&stream_id);
        }
        info!("Stream registry shut down");
    }
}
