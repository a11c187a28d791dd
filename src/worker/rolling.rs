//! Rolling restart coordinator
//!
//! Replaces workers one at a time without dropping below the minimum
//! active count: spawn the replacement concurrently (hiding its startup
//! cost), drain the old worker (pause routing, open its circuit, poll
//! `active_requests` down to zero), verify the replacement with a
//! preflight health check, then swap.
//!
//! State machine: idle → prechecks → draining → verifying → swapping →
//! completed | failed → idle. A watchdog keeps observing the active
//! worker count and aborts an in-flight restart on violation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager::WorkerPoolManager;
use crate::breaker::BreakerRegistry;
use crate::types::{GantryError, Result};

/// Capacity of the rolling event channel
const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct RollingRestartConfig {
    pub drain_timeout: Duration,
    pub preflight_timeout: Duration,
    pub min_active_workers: usize,
    pub watchdog_interval: Duration,
    pub replay_enabled: bool,
    pub max_replay_attempts: u32,
    /// Drain poll cadence
    pub poll_interval: Duration,
}

impl Default for RollingRestartConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            preflight_timeout: Duration::from_secs(10),
            min_active_workers: 1,
            watchdog_interval: Duration::from_secs(1),
            replay_enabled: false,
            max_replay_attempts: 2,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Coordinator phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingPhase {
    Idle,
    Prechecks,
    Draining,
    Verifying,
    Swapping,
    Completed,
    Failed,
}

/// Events emitted during a rolling restart
#[derive(Debug, Clone)]
pub enum RollingEvent {
    DrainStarted {
        worker_id: String,
    },
    DrainCompleted {
        worker_id: String,
        duration_ms: u64,
        timed_out: bool,
    },
    DrainTimeout {
        worker_id: String,
        active_requests: u32,
        queued_requests: usize,
    },
    RequestReplay {
        worker_id: String,
        success: bool,
        attempts: u32,
        replayed_requests: u32,
    },
    WorkerReplaced {
        old_worker_id: String,
        new_worker_id: String,
    },
    RestartCompleted {
        replaced: usize,
    },
    RestartFailed {
        reason: String,
    },
    WatchdogViolation {
        active_workers: usize,
        min_active_workers: usize,
    },
}

/// Outcome reported by a replay hook
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub success: bool,
    pub attempts: u32,
    pub replayed_requests: u32,
}

/// Re-dispatches requests stranded on a worker whose drain timed out.
#[async_trait]
pub trait ReplayHook: Send + Sync {
    async fn replay(&self, worker_id: &str) -> Result<ReplayOutcome>;
}

pub struct RollingRestartCoordinator {
    config: RollingRestartConfig,
    manager: Arc<WorkerPoolManager>,
    breakers: Arc<BreakerRegistry>,
    replay_hook: Option<Arc<dyn ReplayHook>>,
    phase: Mutex<RollingPhase>,
    events: broadcast::Sender<RollingEvent>,
    abort: AtomicBool,
    in_progress: AtomicBool,
    drop_count: AtomicU64,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl RollingRestartCoordinator {
    pub fn new(
        config: RollingRestartConfig,
        manager: Arc<WorkerPoolManager>,
        breakers: Arc<BreakerRegistry>,
        replay_hook: Option<Arc<dyn ReplayHook>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            manager,
            breakers,
            replay_hook,
            phase: Mutex::new(RollingPhase::Idle),
            events,
            abort: AtomicBool::new(false),
            in_progress: AtomicBool::new(false),
            drop_count: AtomicU64::new(0),
            watchdog: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RollingEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> RollingPhase {
        *self.phase.lock().await
    }

    /// Requests dropped across all restarts (drain timeouts without a
    /// successful replay)
    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Start the min-active watchdog.
    pub async fn start_watchdog(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.watchdog_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let active = coordinator.manager.router().active_worker_count();
                if active < coordinator.config.min_active_workers {
                    warn!(
                        active,
                        min = coordinator.config.min_active_workers,
                        "Watchdog: active workers below minimum"
                    );
                    let _ = coordinator.events.send(RollingEvent::WatchdogViolation {
                        active_workers: active,
                        min_active_workers: coordinator.config.min_active_workers,
                    });
                    if coordinator.in_progress.load(Ordering::Acquire) {
                        coordinator.abort.store(true, Ordering::Release);
                    }
                }
            }
        });
        *self.watchdog.lock().await = Some(handle);
    }

    pub async fn stop_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
    }

    /// Roll every current worker, one at a time.
    pub async fn restart_all(self: &Arc<Self>) -> Result<usize> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(GantryError::Validation(
                "rolling restart already in progress".to_string(),
            ));
        }
        self.abort.store(false, Ordering::Release);
        self.set_phase(RollingPhase::Prechecks).await;

        let targets = self.manager.worker_ids();
        info!(workers = targets.len(), "Rolling restart started");

        let mut replaced = 0usize;
        for old_id in targets {
            if self.abort.load(Ordering::Acquire) {
                return self.fail("aborted by watchdog").await;
            }
            match self.restart_one(&old_id).await {
                Ok(_new_id) => replaced += 1,
                Err(e) => return self.fail(&format!("worker {old_id}: {e}")).await,
            }
        }

        self.set_phase(RollingPhase::Completed).await;
        let _ = self.events.send(RollingEvent::RestartCompleted { replaced });
        info!(replaced, "Rolling restart completed");
        self.set_phase(RollingPhase::Idle).await;
        self.in_progress.store(false, Ordering::Release);
        Ok(replaced)
    }

    async fn fail(&self, reason: &str) -> Result<usize> {
        warn!(reason, "Rolling restart failed");
        self.set_phase(RollingPhase::Failed).await;
        let _ = self.events.send(RollingEvent::RestartFailed {
            reason: reason.to_string(),
        });
        self.set_phase(RollingPhase::Idle).await;
        self.in_progress.store(false, Ordering::Release);
        Err(GantryError::Runtime(format!("rolling restart failed: {reason}")))
    }

    /// Drain → verify → swap for a single worker. The replacement is
    /// spawned first so its startup overlaps the drain.
    async fn restart_one(self: &Arc<Self>, old_id: &str) -> Result<String> {
        // Replacement spawn runs concurrently with the drain
        let manager = Arc::clone(&self.manager);
        let spawn_handle = tokio::spawn(async move { manager.spawn_worker().await });

        // Violate-check: the drain effectively removes one worker from
        // service; refuse rather than dip below the floor.
        let active = self.manager.router().active_worker_count();
        if active <= self.config.min_active_workers {
            spawn_handle.abort();
            // The replacement may already be up; take it back out
            if let Ok(Ok(id)) = spawn_handle.await {
                self.manager.remove_worker(&id).await;
            }
            return Err(GantryError::Validation(format!(
                "draining {old_id} would leave {} active workers (min {})",
                active.saturating_sub(1),
                self.config.min_active_workers
            )));
        }

        // Drain
        self.set_phase(RollingPhase::Draining).await;
        let _ = self.events.send(RollingEvent::DrainStarted {
            worker_id: old_id.to_string(),
        });
        self.manager.router().pause_routing(old_id);
        self.breakers.get(old_id).force_open().await;

        let drain_started = Instant::now();
        let timed_out = loop {
            if self.manager.router().active_requests(old_id) == 0 {
                break false;
            }
            if drain_started.elapsed() >= self.config.drain_timeout {
                break true;
            }
            if self.abort.load(Ordering::Acquire) {
                break true;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        };

        let _ = self.events.send(RollingEvent::DrainCompleted {
            worker_id: old_id.to_string(),
            duration_ms: drain_started.elapsed().as_millis() as u64,
            timed_out,
        });

        if timed_out {
            let active_requests = self.manager.router().active_requests(old_id);
            let queued_requests = self.manager.router().sticky_count_for(old_id);
            let _ = self.events.send(RollingEvent::DrainTimeout {
                worker_id: old_id.to_string(),
                active_requests,
                queued_requests,
            });
            self.replay_stranded(old_id, active_requests).await;
        }

        // Verify the replacement
        self.set_phase(RollingPhase::Verifying).await;
        let new_id = match spawn_handle.await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                self.undo_drain(old_id).await;
                return Err(e);
            }
            Err(e) => {
                self.undo_drain(old_id).await;
                return Err(GantryError::Internal(format!("replacement task failed: {e}")));
            }
        };

        if let Err(e) = self
            .manager
            .health_check(&new_id, self.config.preflight_timeout)
            .await
        {
            self.manager.remove_worker(&new_id).await;
            self.undo_drain(old_id).await;
            return Err(GantryError::Runtime(format!(
                "replacement preflight failed: {e}"
            )));
        }

        // Swap
        self.set_phase(RollingPhase::Swapping).await;
        self.breakers.get(old_id).force_close().await;
        self.breakers.remove(old_id);
        self.manager.remove_worker(old_id).await;

        let _ = self.events.send(RollingEvent::WorkerReplaced {
            old_worker_id: old_id.to_string(),
            new_worker_id: new_id.clone(),
        });
        info!(old = %old_id, new = %new_id, "Worker replaced");
        Ok(new_id)
    }

    /// Replay requests stranded on a timed-out drain, counting drops
    /// when replay is disabled or never succeeds.
    async fn replay_stranded(&self, old_id: &str, active_requests: u32) {
        let Some(hook) = (self.config.replay_enabled)
            .then(|| self.replay_hook.clone())
            .flatten()
        else {
            self.drop_count
                .fetch_add(active_requests as u64, Ordering::Relaxed);
            return;
        };

        let mut attempts = 0u32;
        let mut outcome: Option<ReplayOutcome> = None;
        while attempts < self.config.max_replay_attempts {
            attempts += 1;
            match hook.replay(old_id).await {
                Ok(result) => {
                    outcome = Some(result);
                    break;
                }
                Err(e) => {
                    warn!(worker = %old_id, attempt = attempts, error = %e, "Replay attempt failed");
                }
            }
        }

        match outcome {
            Some(outcome) => {
                if !outcome.success {
                    self.drop_count
                        .fetch_add(active_requests as u64, Ordering::Relaxed);
                }
                let _ = self.events.send(RollingEvent::RequestReplay {
                    worker_id: old_id.to_string(),
                    success: outcome.success,
                    attempts: outcome.attempts.max(attempts),
                    replayed_requests: outcome.replayed_requests,
                });
            }
            None => {
                self.drop_count
                    .fetch_add(active_requests as u64, Ordering::Relaxed);
                let _ = self.events.send(RollingEvent::RequestReplay {
                    worker_id: old_id.to_string(),
                    success: false,
                    attempts,
                    replayed_requests: 0,
                });
            }
        }
    }

    /// Abort path: put the old worker back into service.
    async fn undo_drain(&self, old_id: &str) {
        self.breakers.get(old_id).force_close().await;
        self.manager.router().resume_routing(old_id);
    }

    async fn set_phase(&self, phase: RollingPhase) {
        *self.phase.lock().await = phase;
    }
}
