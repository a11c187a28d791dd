//! Bounded-concurrency request gate
//!
//! Serializes expensive worker calls (model loads) at a fixed
//! concurrency. Callers park on the semaphore in arrival order; the
//! queue refuses new work once shutdown has begun.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::types::{GantryError, Result};

/// Snapshot of queue counters
#[derive(Debug, Clone)]
pub struct RequestQueueStats {
    /// Operations currently holding a permit
    pub in_flight: usize,
    /// Permits configured
    pub max_concurrent: usize,
    /// Total operations executed
    pub total_executed: u64,
    /// Total operations that failed
    pub total_failed: u64,
}

/// Semaphore-gated execution queue
pub struct RequestQueue {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    total_executed: AtomicU64,
    total_failed: AtomicU64,
    closed: AtomicBool,
}

impl RequestQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_concurrent: max_concurrent.max(1),
            total_executed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `op` once a permit is available. The permit is held for the
    /// whole duration of the operation.
    pub async fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(GantryError::Shutdown("request queue closed".to_string()));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GantryError::Shutdown("request queue closed".to_string()))?;

        if self.closed.load(Ordering::Acquire) {
            return Err(GantryError::Shutdown("request queue closed".to_string()));
        }

        let result = op.await;
        self.total_executed.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Refuse new work and wake parked waiters with a shutdown error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    pub fn stats(&self) -> RequestQueueStats {
        RequestQueueStats {
            in_flight: self.max_concurrent - self.semaphore.available_permits(),
            max_concurrent: self.max_concurrent,
            total_executed: self.total_executed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_executes_and_counts() {
        let queue = RequestQueue::new(2);
        let value = queue.execute(async { Ok::<_, GantryError>(42) }).await.unwrap();
        assert_eq!(value, 42);
        let stats = queue.stats();
        assert_eq!(stats.total_executed, 1);
        assert_eq!(stats.total_failed, 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = Arc::new(RequestQueue::new(1));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let q = Arc::clone(&queue);
        let slow = tokio::spawn(async move {
            q.execute(async {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok::<_, GantryError>(())
            })
            .await
        });

        started_rx.await.unwrap();

        // Second op cannot start while the first holds the only permit
        let q = Arc::clone(&queue);
        let fast = tokio::spawn(async move { q.execute(async { Ok::<_, GantryError>(7) }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fast.is_finished());
        assert_eq!(queue.stats().in_flight, 1);

        let _ = release_tx.send(());
        slow.await.unwrap().unwrap();
        assert_eq!(fast.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let queue = Arc::new(RequestQueue::new(1));
        queue.close();
        let result = queue.execute(async { Ok::<_, GantryError>(()) }).await;
        assert!(matches!(result, Err(GantryError::Shutdown(_))));
    }
}
