//! Worker pool manager
//!
//! Owns the worker map (single source of truth for worker state),
//! spawns the configured number of workers in parallel, monitors
//! heartbeats and restarts failed workers with exponential backoff.
//!
//! Status transitions are atomic with router registration: a worker is
//! registered with the router before its `Ready` event is emitted, and
//! unregistered before its `Failed` event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::router::RuntimeRouter;
use super::runtime::WorkerSpawner;
use super::WorkerStatus;
use crate::rpc::messages::notifications;
use crate::rpc::WorkerLink;
use crate::types::{GantryError, Result};

/// Capacity of the worker event channel
const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub max_restarts: u32,
    /// Base delay for restart backoff; doubled per prior restart
    pub restart_delay: Duration,
    pub health_check_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of one worker's state
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub last_heartbeat: Instant,
    pub started_at: Instant,
    pub runtime: String,
    pub error: Option<String>,
}

/// Lifecycle events emitted on the manager's broadcast channel
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ready { worker_id: String },
    Failed { worker_id: String, reason: String },
    Restarted { worker_id: String, restart_count: u32 },
    Abandoned { worker_id: String, restart_count: u32 },
    Stopped { worker_id: String },
}

struct WorkerEntry {
    state: WorkerState,
    link: Arc<dyn WorkerLink>,
    heartbeat_task: JoinHandle<()>,
}

pub struct WorkerPoolManager {
    config: WorkerPoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    router: Arc<RuntimeRouter>,
    workers: DashMap<String, WorkerEntry>,
    events: broadcast::Sender<WorkerEvent>,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolManager {
    pub fn new(
        config: WorkerPoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        router: Arc<RuntimeRouter>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            spawner,
            router,
            workers: DashMap::new(),
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Spawn the configured workers in parallel and start heartbeat
    /// monitoring. Individual spawn failures are logged; startup
    /// succeeds if at least one worker came up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let spawns = (0..self.config.worker_count)
            .map(|_| self.spawn_worker())
            .collect::<Vec<_>>();
        let results = futures::future::join_all(spawns).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        for result in &results {
            if let Err(e) = result {
                error!(error = %e, "Worker failed to start");
            }
        }
        if ok == 0 {
            return Err(GantryError::Runtime(
                "no workers could be started".to_string(),
            ));
        }
        info!(started = ok, requested = self.config.worker_count, "Worker pool started");

        let manager = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if manager.shutdown.load(Ordering::Acquire) {
                    break;
                }
                manager.check_heartbeats().await;
                manager.router.prune_sticky();
            }
        });
        self.tasks.lock().await.push(monitor);

        Ok(())
    }

    /// Spawn one new worker with a fresh id. Used at startup and by the
    /// rolling restart coordinator for replacements.
    pub async fn spawn_worker(self: &Arc<Self>) -> Result<String> {
        let worker_id = Uuid::new_v4().to_string();
        self.spawn_into(worker_id.clone(), 0).await?;
        Ok(worker_id)
    }

    async fn spawn_into(self: &Arc<Self>, worker_id: String, restart_count: u32) -> Result<()> {
        let spawned = self.spawner.spawn().await?;
        let now = Instant::now();

        let heartbeat_task = self.spawn_heartbeat_listener(&worker_id, &spawned.link);

        let state = WorkerState {
            id: worker_id.clone(),
            pid: spawned.pid,
            status: WorkerStatus::Idle,
            restart_count,
            last_heartbeat: now,
            started_at: now,
            runtime: spawned.runtime,
            error: None,
        };
        self.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                state,
                link: spawned.link,
                heartbeat_task,
            },
        );

        // Registration precedes the Ready event: no consumer may
        // observe a ready worker the router does not know.
        self.router.register(&worker_id, WorkerStatus::Idle);
        let _ = self.events.send(WorkerEvent::Ready {
            worker_id: worker_id.clone(),
        });
        info!(worker = %worker_id, "Worker ready");
        Ok(())
    }

    /// Listens for heartbeat notifications and refreshes the worker's
    /// liveness timestamp.
    fn spawn_heartbeat_listener(
        self: &Arc<Self>,
        worker_id: &str,
        link: &Arc<dyn WorkerLink>,
    ) -> JoinHandle<()> {
        let mut rx = link.subscribe();
        let manager = Arc::clone(self);
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        if notification.method == notifications::WORKER_HEARTBEAT {
                            if let Some(mut entry) = manager.workers.get_mut(&worker_id) {
                                entry.state.last_heartbeat = Instant::now();
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(worker = %worker_id, skipped, "Heartbeat listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Mark stale workers failed and kick off their restart.
    async fn check_heartbeats(self: &Arc<Self>) {
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|e| e.state.status.is_active())
            .filter(|e| e.state.last_heartbeat.elapsed() > self.config.heartbeat_timeout)
            .map(|e| e.state.id.clone())
            .collect();

        for worker_id in stale {
            warn!(worker = %worker_id, "Heartbeat timeout");
            self.handle_failure(&worker_id, "heartbeat timeout").await;
        }
    }

    /// Transition a worker to failed, pull it from the router and
    /// schedule a restart.
    pub async fn handle_failure(self: &Arc<Self>, worker_id: &str, reason: &str) {
        {
            let Some(mut entry) = self.workers.get_mut(worker_id) else {
                return;
            };
            if entry.state.status == WorkerStatus::Failed {
                return;
            }
            entry.state.status = WorkerStatus::Failed;
            entry.state.error = Some(reason.to_string());
        }
        self.router.unregister(worker_id);
        let _ = self.events.send(WorkerEvent::Failed {
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
        });

        let manager = Arc::clone(self);
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            manager.restart_worker(&worker_id).await;
        });
    }

    /// Restart with exponential backoff `restart_delay × 2^(n−1)`.
    /// Abandoned once `max_restarts` is reached; cancelled if shutdown
    /// was requested while the delay was pending.
    async fn restart_worker(self: &Arc<Self>, worker_id: &str) {
        loop {
            let restart_count = {
                let Some(entry) = self.workers.get(worker_id) else { return };
                entry.state.restart_count + 1
            };

            if restart_count > self.config.max_restarts {
                warn!(
                    worker = %worker_id,
                    restarts = restart_count - 1,
                    "Worker abandoned after max restarts"
                );
                let _ = self.events.send(WorkerEvent::Abandoned {
                    worker_id: worker_id.to_string(),
                    restart_count: restart_count - 1,
                });
                return;
            }

            let delay = self.config.restart_delay * 2u32.saturating_pow(restart_count - 1);
            debug!(worker = %worker_id, ?delay, attempt = restart_count, "Restart scheduled");
            tokio::time::sleep(delay).await;

            if self.shutdown.load(Ordering::Acquire) {
                debug!(worker = %worker_id, "Restart cancelled by shutdown");
                return;
            }

            // Tear down the old process before spawning anew
            if let Some((_, old)) = self.workers.remove(worker_id) {
                old.heartbeat_task.abort();
                let _ = old.link.shutdown(Duration::from_secs(1)).await;
            }

            match self.spawn_into(worker_id.to_string(), restart_count).await {
                Ok(()) => {
                    let _ = self.events.send(WorkerEvent::Restarted {
                        worker_id: worker_id.to_string(),
                        restart_count,
                    });
                    info!(worker = %worker_id, attempt = restart_count, "Worker restarted");
                    return;
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Worker restart failed");
                    // Re-insert a failed placeholder so the next loop
                    // iteration continues the backoff sequence
                    let now = Instant::now();
                    let state = WorkerState {
                        id: worker_id.to_string(),
                        pid: None,
                        status: WorkerStatus::Failed,
                        restart_count,
                        last_heartbeat: now,
                        started_at: now,
                        runtime: String::new(),
                        error: Some(e.to_string()),
                    };
                    let idle_task = tokio::spawn(async {});
                    self.workers.insert(
                        worker_id.to_string(),
                        WorkerEntry {
                            state,
                            link: Arc::new(DeadLink),
                            heartbeat_task: idle_task,
                        },
                    );
                }
            }
        }
    }

    /// Remove a worker permanently (rolling-restart swap).
    pub async fn remove_worker(self: &Arc<Self>, worker_id: &str) {
        self.router.unregister(worker_id);
        if let Some((_, entry)) = self.workers.remove(worker_id) {
            entry.heartbeat_task.abort();
            let _ = entry.link.shutdown(self.config.shutdown_timeout).await;
            let _ = self.events.send(WorkerEvent::Stopped {
                worker_id: worker_id.to_string(),
            });
            info!(worker = %worker_id, "Worker removed");
        }
    }

    pub fn link(&self, worker_id: &str) -> Option<Arc<dyn WorkerLink>> {
        self.workers.get(worker_id).map(|e| Arc::clone(&e.link))
    }

    pub fn state(&self, worker_id: &str) -> Option<WorkerState> {
        self.workers.get(worker_id).map(|e| e.state.clone())
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.state.id.clone()).collect()
    }

    pub fn router(&self) -> &Arc<RuntimeRouter> {
        &self.router
    }

    /// Probe a worker with a cheap info request.
    pub async fn health_check(&self, worker_id: &str, budget: Duration) -> Result<()> {
        let link = self
            .link(worker_id)
            .ok_or_else(|| GantryError::NotFound(format!("worker {worker_id}")))?;
        link.request(
            crate::rpc::messages::methods::RUNTIME_INFO,
            Value::Null,
            Some(budget),
        )
        .await
        .map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn touch_heartbeat(&self, worker_id: &str) {
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.state.last_heartbeat = Instant::now();
        }
    }

    /// Idempotent shutdown: cancel monitors, stop every worker within
    /// the configured budget (force-kill past it).
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let ids: Vec<String> = self.worker_ids();
        for worker_id in ids {
            self.router.unregister(&worker_id);
            if let Some((_, entry)) = self.workers.remove(&worker_id) {
                entry.heartbeat_task.abort();
                if let Err(e) = entry.link.shutdown(self.config.shutdown_timeout).await {
                    warn!(worker = %worker_id, error = %e, "Worker shutdown exceeded budget");
                }
                let _ = self.events.send(WorkerEvent::Stopped {
                    worker_id: worker_id.clone(),
                });
            }
        }
        info!("Worker pool shut down");
    }
}

/// Placeholder link for workers whose restart is still pending
struct DeadLink;

#[async_trait::async_trait]
impl WorkerLink for DeadLink {
    async fn request(
        &self,
        _method: &str,
        _params: Value,
        _timeout: Option<Duration>,
    ) -> Result<Value> {
        Err(GantryError::Runtime("worker is down".to_string()))
    }

    async fn notify(&self, _method: &str, _params: Value) -> Result<()> {
        Err(GantryError::Runtime("worker is down".to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<crate::rpc::Notification>> {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        rx
    }

    fn is_alive(&self) -> bool {
        false
    }

    async fn shutdown(&self, _budget: Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::MockWorkerLink;
    use crate::worker::router::RoutingStrategy;
    use crate::worker::runtime::SpawnedWorker;
    use std::sync::atomic::AtomicUsize;

    struct MockSpawner {
        spawned: AtomicUsize,
        fail_spawns: AtomicBool,
        links: std::sync::Mutex<Vec<Arc<MockWorkerLink>>>,
    }

    impl MockSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawned: AtomicUsize::new(0),
                fail_spawns: AtomicBool::new(false),
                links: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl WorkerSpawner for MockSpawner {
        async fn spawn(&self) -> Result<SpawnedWorker> {
            if self.fail_spawns.load(Ordering::SeqCst) {
                return Err(GantryError::Runtime("spawn refused".to_string()));
            }
            let n = self.spawned.fetch_add(1, Ordering::SeqCst);
            let link = Arc::new(MockWorkerLink::ok());
            self.links.lock().unwrap().push(Arc::clone(&link));
            Ok(SpawnedWorker {
                pid: Some(1000 + n as u32),
                runtime: "mock".to_string(),
                link,
            })
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 2,
            max_restarts: 2,
            restart_delay: Duration::from_millis(10),
            health_check_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(60),
            shutdown_timeout: Duration::from_millis(100),
        }
    }

    fn new_manager(spawner: Arc<MockSpawner>) -> Arc<WorkerPoolManager> {
        let router = Arc::new(RuntimeRouter::new(RoutingStrategy::RoundRobin));
        WorkerPoolManager::new(fast_config(), spawner, router)
    }

    #[tokio::test]
    async fn test_start_spawns_and_registers_workers() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        // Subscribe before start so the Ready events are observed
        let mut events = manager.subscribe();

        manager.start().await.unwrap();
        assert_eq!(manager.worker_ids().len(), 2);
        assert_eq!(manager.router().active_worker_count(), 2);

        // Registration happened before Ready was emitted
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                WorkerEvent::Ready { worker_id } => {
                    assert!(manager.router().worker_ids().contains(&worker_id));
                }
                other => panic!("expected Ready, got {other:?}"),
            }
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_triggers_restart() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        manager.start().await.unwrap();
        let mut events = manager.subscribe();

        // No heartbeats arrive; monitor marks both failed and restarts
        let mut saw_failed = false;
        let mut saw_restarted = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline && !(saw_failed && saw_restarted) {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(WorkerEvent::Failed { reason, .. })) => {
                    assert_eq!(reason, "heartbeat timeout");
                    saw_failed = true;
                }
                Ok(Ok(WorkerEvent::Restarted { .. })) => saw_restarted = true,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_failed && saw_restarted);
        assert!(spawner.spawned.load(Ordering::SeqCst) > 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_notifications_keep_worker_alive() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        manager.start().await.unwrap();
        let ids = manager.worker_ids();

        // Keep refreshing heartbeats; no failures should occur
        for _ in 0..5 {
            for id in &ids {
                manager.touch_heartbeat(id);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for id in &ids {
            assert_eq!(manager.state(id).unwrap().status, WorkerStatus::Idle);
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_abandoned_after_max_restarts() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        manager.start().await.unwrap();
        let victim = manager.worker_ids().remove(0);
        let mut events = manager.subscribe();

        // Force repeated failures faster than heartbeats can refresh
        spawner.fail_spawns.store(true, Ordering::SeqCst);
        manager.handle_failure(&victim, "induced failure").await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut abandoned = false;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if let WorkerEvent::Abandoned { worker_id, restart_count } = event {
                assert_eq!(worker_id, victim);
                assert_eq!(restart_count, 2);
                abandoned = true;
                break;
            }
        }
        assert!(abandoned);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_restart() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        manager.start().await.unwrap();
        let victim = manager.worker_ids().remove(0);

        manager.handle_failure(&victim, "induced").await;
        let before = spawner.spawned.load(Ordering::SeqCst);
        // Shutdown lands inside the restart delay window
        manager.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_failed_worker_unregistered_from_router() {
        let spawner = MockSpawner::new();
        let manager = new_manager(Arc::clone(&spawner));
        manager.start().await.unwrap();
        let victim = manager.worker_ids().remove(0);

        manager.handle_failure(&victim, "induced").await;
        assert!(!manager.router().worker_ids().contains(&victim));
        manager.shutdown().await;
    }
}
