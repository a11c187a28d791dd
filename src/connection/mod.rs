//! Persistent worker connection pool
//!
//! Keeps a warmed set of IPC connections to inference workers. Acquire
//! policy: reuse a free healthy connection, grow up to the maximum,
//! otherwise park in a FIFO waiter queue with a timeout. Released
//! connections are handed to the longest-waiting caller atomically.
//!
//! A periodic maintenance task health-checks idle connections with a
//! cheap `runtime.info` request, destroys unhealthy or long-idle ones,
//! and replenishes back to the minimum unless shutdown has begun.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rpc::messages::methods;
use crate::rpc::WorkerLink;
use crate::types::{GantryError, Result};

/// Health probe budget per connection
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rolling acquire-time sample window
const ACQUIRE_TIME_SAMPLES: usize = 100;

/// Creates new worker connections for the pool.
///
/// `preferred_worker` lets routed callers land on a specific worker's
/// link; factories may ignore the preference when that worker has no
/// spare capacity.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, preferred_worker: Option<&str>)
        -> Result<(String, Arc<dyn WorkerLink>)>;
}

#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub enabled: bool,
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub warmup_on_start: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            warmup_on_start: true,
        }
    }
}

/// Connection metadata tracked by the pool
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub worker_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub healthy: bool,
    pub acquired: bool,
}

struct PooledConnection {
    info: ConnectionInfo,
    link: Arc<dyn WorkerLink>,
}

/// An acquired connection. Must be given back with
/// [`ConnectionPool::release`] when the caller is done.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub worker_id: String,
    pub link: Arc<dyn WorkerLink>,
}

struct PoolInner {
    connections: HashMap<String, PooledConnection>,
    waiters: VecDeque<oneshot::Sender<ConnectionHandle>>,
    /// Connections being created outside the lock (reserved slots)
    creating: usize,
}

/// Pool statistics snapshot
#[derive(Debug, Clone)]
pub struct ConnectionPoolStats {
    pub size: usize,
    pub available: usize,
    pub waiters: usize,
    pub total_acquires: u64,
    pub total_releases: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub acquire_timeouts: u64,
    /// Σ use_count / size
    pub reuse_rate: f64,
    /// Rolling average over the last 100 acquires, in milliseconds
    pub avg_acquire_time_ms: f64,
}

pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
    acquire_timeouts: AtomicU64,
    acquire_times: Mutex<VecDeque<f64>>,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            inner: Mutex::new(PoolInner {
                connections: HashMap::new(),
                waiters: VecDeque::new(),
                creating: 0,
            }),
            total_acquires: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_destroyed: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            acquire_times: Mutex::new(VecDeque::with_capacity(ACQUIRE_TIME_SAMPLES)),
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Warm up to `min_connections` and start the maintenance task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.warmup_on_start {
            let warmups = (0..self.config.min_connections)
                .map(|_| self.create_connection(None))
                .collect::<Vec<_>>();
            let results = futures::future::join_all(warmups).await;
            let ok = results.iter().filter(|r| r.is_ok()).count();
            info!(
                warmed = ok,
                requested = self.config.min_connections,
                "Connection pool warmup complete"
            );
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if pool.shutdown.load(Ordering::Acquire) {
                    break;
                }
                pool.run_health_checks().await;
                pool.run_idle_cleanup().await;
            }
        });
        self.tasks.lock().await.push(handle);

        Ok(())
    }

    /// Acquire a connection, preferring one bound to `preferred_worker`.
    pub async fn acquire(self: &Arc<Self>, preferred_worker: Option<&str>) -> Result<ConnectionHandle> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(GantryError::Shutdown("connection pool closed".to_string()));
        }
        let started = Instant::now();

        // Fast path: reuse a free healthy connection, preferring one
        // bound to the requested worker. Stickiness is best effort: any
        // free connection serves when nothing matches the preference.
        let reuse = {
            let mut inner = self.inner.lock().await;
            let free_lru = |inner: &PoolInner, want_worker: Option<&str>| {
                inner
                    .connections
                    .values()
                    .filter(|c| !c.info.acquired && c.info.healthy)
                    .filter(|c| {
                        want_worker
                            .map(|w| c.info.worker_id == w)
                            .unwrap_or(true)
                    })
                    .min_by_key(|c| c.info.last_used_at)
                    .map(|c| c.info.id.clone())
            };
            let picked = free_lru(&inner, preferred_worker)
                .or_else(|| free_lru(&inner, None));

            picked
                .and_then(|id| inner.connections.get_mut(&id))
                .map(|conn| {
                    conn.info.acquired = true;
                    conn.info.use_count += 1;
                    conn.info.last_used_at = Instant::now();
                    ConnectionHandle {
                        id: conn.info.id.clone(),
                        worker_id: conn.info.worker_id.clone(),
                        link: Arc::clone(&conn.link),
                    }
                })
        };
        if let Some(handle) = reuse {
            self.record_acquire(started).await;
            return Ok(handle);
        }

        // Grow the pool if there is room
        let can_grow = {
            let mut inner = self.inner.lock().await;
            if inner.connections.len() + inner.creating < self.config.max_connections {
                inner.creating += 1;
                true
            } else {
                false
            }
        };
        if can_grow {
            let created = self.create_acquired(preferred_worker).await;
            {
                let mut inner = self.inner.lock().await;
                inner.creating = inner.creating.saturating_sub(1);
            }
            let handle = created?;
            self.record_acquire(started).await;
            return Ok(handle);
        }

        // Park as a waiter
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.waiters.push_back(tx);
        }
        match timeout(self.config.acquire_timeout, rx).await {
            Ok(Ok(handle)) => {
                self.record_acquire(started).await;
                Ok(handle)
            }
            Ok(Err(_)) => Err(GantryError::Shutdown("connection pool closed".to_string())),
            Err(_) => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(GantryError::PoolExhausted(format!(
                    "no connection within {}ms",
                    self.config.acquire_timeout.as_millis()
                )))
            }
        }
    }

    /// Return a connection. If waiters are parked, the same connection
    /// is handed to the first live one without ever appearing free.
    pub async fn release(self: &Arc<Self>, handle: &ConnectionHandle) {
        self.total_releases.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.get_mut(&handle.id) else {
            // Destroyed while acquired (health check cannot touch
            // acquired connections, but shutdown can)
            return;
        };
        conn.info.acquired = false;
        conn.info.last_used_at = Instant::now();

        let next = ConnectionHandle {
            id: conn.info.id.clone(),
            worker_id: conn.info.worker_id.clone(),
            link: Arc::clone(&conn.link),
        };

        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.send(next.clone()).is_ok() {
                if let Some(conn) = inner.connections.get_mut(&handle.id) {
                    conn.info.acquired = true;
                    conn.info.use_count += 1;
                    conn.info.last_used_at = Instant::now();
                }
                return;
            }
            // Waiter timed out and dropped its receiver; try the next
        }
    }

    async fn create_connection(self: &Arc<Self>, preferred_worker: Option<&str>) -> Result<String> {
        let (worker_id, link) = self.factory.connect(preferred_worker).await?;
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let info = ConnectionInfo {
            id: id.clone(),
            worker_id,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
            acquired: false,
        };
        debug!(connection = %id, worker = %info.worker_id, "Connection created");
        self.total_created.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .await
            .connections
            .insert(id.clone(), PooledConnection { info, link });
        Ok(id)
    }

    async fn create_acquired(
        self: &Arc<Self>,
        preferred_worker: Option<&str>,
    ) -> Result<ConnectionHandle> {
        let id = self.create_connection(preferred_worker).await?;
        let mut inner = self.inner.lock().await;
        let conn = inner
            .connections
            .get_mut(&id)
            .ok_or_else(|| GantryError::Internal("created connection vanished".to_string()))?;
        conn.info.acquired = true;
        conn.info.use_count += 1;
        Ok(ConnectionHandle {
            id: conn.info.id.clone(),
            worker_id: conn.info.worker_id.clone(),
            link: Arc::clone(&conn.link),
        })
    }

    /// Probe idle connections with a cheap info request; destroy any
    /// that fail. Acquired connections are never probed.
    async fn run_health_checks(self: &Arc<Self>) {
        let probes: Vec<(String, Arc<dyn WorkerLink>)> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .values()
                .filter(|c| !c.info.acquired && c.info.healthy)
                .map(|c| (c.info.id.clone(), Arc::clone(&c.link)))
                .collect()
        };

        for (id, link) in probes {
            let healthy = link
                .request(methods::RUNTIME_INFO, Value::Null, Some(HEALTH_PROBE_TIMEOUT))
                .await
                .is_ok();
            if !healthy {
                warn!(connection = %id, "Health check failed, destroying connection");
                self.destroy(&id).await;
            }
        }
    }

    /// Destroy connections idle past the threshold, then replenish to
    /// the minimum unless shutting down.
    async fn run_idle_cleanup(self: &Arc<Self>) {
        let idle: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .values()
                .filter(|c| !c.info.acquired)
                .filter(|c| c.info.last_used_at.elapsed() > self.config.idle_timeout)
                .map(|c| c.info.id.clone())
                .collect()
        };
        for id in idle {
            debug!(connection = %id, "Evicting idle connection");
            self.destroy(&id).await;
        }

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            {
                let mut inner = self.inner.lock().await;
                if inner.connections.len() + inner.creating >= self.config.min_connections {
                    return;
                }
                inner.creating += 1;
            }
            let result = self.create_connection(None).await;
            {
                let mut inner = self.inner.lock().await;
                inner.creating = inner.creating.saturating_sub(1);
            }
            if let Err(e) = result {
                warn!(error = %e, "Failed to replenish connection pool");
                return;
            }
        }
    }

    async fn destroy(self: &Arc<Self>, id: &str) {
        let removed = self.inner.lock().await.connections.remove(id);
        if let Some(conn) = removed {
            self.total_destroyed.fetch_add(1, Ordering::Relaxed);
            let _ = conn.link.shutdown(Duration::from_secs(1)).await;
        }
    }

    async fn record_acquire(&self, started: Instant) {
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        let mut times = self.acquire_times.lock().await;
        if times.len() >= ACQUIRE_TIME_SAMPLES {
            times.pop_front();
        }
        times.push_back(started.elapsed().as_secs_f64() * 1000.0);
    }

    pub async fn stats(&self) -> ConnectionPoolStats {
        let inner = self.inner.lock().await;
        let size = inner.connections.len();
        let available = inner
            .connections
            .values()
            .filter(|c| !c.info.acquired && c.info.healthy)
            .count();
        let total_use: u64 = inner.connections.values().map(|c| c.info.use_count).sum();
        let times = self.acquire_times.lock().await;
        let avg_acquire_time_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };

        ConnectionPoolStats {
            size,
            available,
            waiters: inner.waiters.len(),
            total_acquires: self.total_acquires.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_destroyed: self.total_destroyed.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            reuse_rate: if size == 0 {
                0.0
            } else {
                total_use as f64 / size as f64
            },
            avg_acquire_time_ms,
        }
    }

    /// Idempotent shutdown: cancel maintenance, fail parked waiters,
    /// close every connection.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let (waiters, connections) = {
            let mut inner = self.inner.lock().await;
            let waiters: Vec<_> = inner.waiters.drain(..).collect();
            let connections: Vec<_> = inner.connections.drain().map(|(_, c)| c).collect();
            (waiters, connections)
        };
        drop(waiters); // dropping the senders fails all parked acquires

        for conn in connections {
            self.total_destroyed.fetch_add(1, Ordering::Relaxed);
            let _ = conn.link.shutdown(Duration::from_secs(1)).await;
        }
        info!("Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::MockWorkerLink;
    use std::sync::atomic::AtomicUsize;

    struct MockFactory {
        counter: AtomicUsize,
        /// Probes on links created while this is set keep failing
        fail_info: Arc<AtomicBool>,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                fail_info: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockFactory {
        async fn connect(
            &self,
            preferred_worker: Option<&str>,
        ) -> Result<(String, Arc<dyn WorkerLink>)> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let worker = preferred_worker
                .map(str::to_string)
                .unwrap_or_else(|| format!("worker-{n}"));
            let fail = Arc::clone(&self.fail_info);
            let created_failing = fail.load(Ordering::SeqCst);
            let link = MockWorkerLink::new(move |method, _| {
                let failing = created_failing || fail.load(Ordering::SeqCst);
                if failing && method == methods::RUNTIME_INFO {
                    Err(GantryError::Runtime("probe failed".to_string()))
                } else {
                    Ok(Value::Null)
                }
            });
            Ok((worker, Arc::new(link)))
        }
    }

    fn small_config() -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            min_connections: 1,
            max_connections: 2,
            acquire_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_millis(50),
            warmup_on_start: true,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_warmup_creates_min_connections() {
        let pool = ConnectionPool::new(small_config(), MockFactory::new());
        pool.start().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.available, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_connection() {
        let pool = ConnectionPool::new(small_config(), MockFactory::new());
        pool.start().await.unwrap();

        let first = pool.acquire(None).await.unwrap();
        let first_id = first.id.clone();
        pool.release(&first).await;

        let second = pool.acquire(None).await.unwrap();
        assert_eq!(second.id, first_id);
        pool.release(&second).await;

        let stats = pool.stats().await;
        assert_eq!(stats.total_created, 1);
        assert!(stats.reuse_rate >= 2.0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_grows_to_max_then_queues() {
        let pool = ConnectionPool::new(small_config(), MockFactory::new());
        pool.start().await.unwrap();

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.stats().await.size, 2);

        // Third acquire must wait for a release
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(&a).await;
        let c = waiter.await.unwrap().unwrap();
        assert_eq!(c.id, a.id);
        pool.release(&b).await;
        pool.release(&c).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_times_out_with_pool_exhausted() {
        let pool = ConnectionPool::new(small_config(), MockFactory::new());
        pool.start().await.unwrap();
        let _a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();

        let result = pool.acquire(None).await;
        assert!(matches!(result, Err(GantryError::PoolExhausted(_))));
        assert_eq!(pool.stats().await.acquire_timeouts, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_destroys_and_replenishes() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(
            small_config(),
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
        );
        pool.start().await.unwrap();
        assert_eq!(pool.stats().await.size, 1);

        // All existing links now fail their probes; replacements are
        // created healthy because `fail_info` only affects new probes
        // against the same flag, so flip it back after one cycle.
        factory.fail_info.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        factory.fail_info.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let stats = pool.stats().await;
        assert!(stats.total_destroyed >= 1);
        assert!(stats.size >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_cleanup_keeps_min_floor() {
        let config = ConnectionPoolConfig {
            idle_timeout: Duration::from_millis(30),
            health_check_interval: Duration::from_millis(40),
            ..small_config()
        };
        let pool = ConnectionPool::new(config, MockFactory::new());
        pool.start().await.unwrap();

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        pool.release(&a).await;
        pool.release(&b).await;
        assert_eq!(pool.stats().await.size, 2);

        // Both go idle; cleanup evicts them and replenishes to min
        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = pool.stats().await;
        assert!(stats.total_destroyed >= 1);
        assert_eq!(stats.size, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let pool = ConnectionPool::new(small_config(), MockFactory::new());
        pool.start().await.unwrap();
        let _a = pool.acquire(None).await.unwrap();
        let _b = pool.acquire(None).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(result.is_err());
    }
}
