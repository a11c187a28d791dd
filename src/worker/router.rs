//! Runtime router: selects a worker per request
//!
//! Holds lightweight `{status, active_requests, paused}` snapshots and
//! a sticky `stream_id → worker_id` map with a 5-minute TTL, so a
//! stream keeps hitting the worker that began it. Selection strategies:
//!
//! - **round-robin**: stable rotation over idle workers
//! - **least-busy**: smallest `active_requests` over idle and busy
//!   workers, ties broken by rotation
//!
//! A worker that is not idle or busy is never returned. Routing to a
//! worker can be paused (rolling-restart drain) without unregistering.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use super::WorkerStatus;
use crate::types::{GantryError, Result};

/// Sticky session lifetime
pub const STICKY_SESSION_TTL: Duration = Duration::from_secs(300);

/// Worker selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastBusy,
}

impl FromStr for RoutingStrategy {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "least-busy" => Ok(RoutingStrategy::LeastBusy),
            other => Err(GantryError::Validation(format!(
                "unknown routing strategy '{other}'"
            ))),
        }
    }
}

struct RouteEntry {
    status: WorkerStatus,
    active_requests: u32,
    paused: bool,
}

struct StickyEntry {
    worker_id: String,
    expires_at: Instant,
}

/// Router over registered workers
pub struct RuntimeRouter {
    entries: DashMap<String, RouteEntry>,
    /// Registration order, for stable rotation
    order: RwLock<Vec<String>>,
    sticky: DashMap<String, StickyEntry>,
    cursor: AtomicUsize,
    strategy: RoutingStrategy,
    sticky_ttl: Duration,
}

impl RuntimeRouter {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            entries: DashMap::new(),
            order: RwLock::new(Vec::new()),
            sticky: DashMap::new(),
            cursor: AtomicUsize::new(0),
            strategy,
            sticky_ttl: STICKY_SESSION_TTL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_sticky_ttl(mut self, ttl: Duration) -> Self {
        self.sticky_ttl = ttl;
        self
    }

    /// Register a worker. Must happen before the worker is announced
    /// ready, so the router never learns about a worker after callers do.
    pub fn register(&self, worker_id: &str, status: WorkerStatus) {
        self.entries.insert(
            worker_id.to_string(),
            RouteEntry {
                status,
                active_requests: 0,
                paused: false,
            },
        );
        let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
        if !order.iter().any(|id| id == worker_id) {
            order.push(worker_id.to_string());
        }
        debug!(worker = %worker_id, "Worker registered with router");
    }

    /// Remove a worker and its sticky sessions.
    pub fn unregister(&self, worker_id: &str) {
        self.entries.remove(worker_id);
        let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
        order.retain(|id| id != worker_id);
        self.sticky.retain(|_, v| v.worker_id != worker_id);
        debug!(worker = %worker_id, "Worker unregistered from router");
    }

    pub fn set_status(&self, worker_id: &str, status: WorkerStatus) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.status = status;
        }
    }

    /// Pause routing to a worker (drain). Existing sticky entries stop
    /// resolving while paused.
    pub fn pause_routing(&self, worker_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.paused = true;
        }
    }

    pub fn resume_routing(&self, worker_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.paused = false;
        }
    }

    /// Select a worker for a request, honoring sticky sessions.
    pub fn route(&self, stream_id: Option<&str>) -> Result<String> {
        // Sticky hit: same worker for the stream while it lives
        if let Some(stream_id) = stream_id {
            if let Some(sticky) = self.sticky.get(stream_id) {
                if sticky.expires_at > Instant::now() {
                    let worker_id = sticky.worker_id.clone();
                    drop(sticky);
                    let eligible = self
                        .entries
                        .get(&worker_id)
                        .map(|e| e.status.is_active() && !e.paused)
                        .unwrap_or(false);
                    if eligible {
                        self.mark_worker_busy(&worker_id);
                        return Ok(worker_id);
                    }
                } else {
                    drop(sticky);
                    self.sticky.remove(stream_id);
                }
            }
        }

        let selected = self.select()?;
        self.mark_worker_busy(&selected);

        if let Some(stream_id) = stream_id {
            self.sticky.insert(
                stream_id.to_string(),
                StickyEntry {
                    worker_id: selected.clone(),
                    expires_at: Instant::now() + self.sticky_ttl,
                },
            );
        }

        Ok(selected)
    }

    fn select(&self) -> Result<String> {
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());

        let eligible: Vec<(String, u32)> = order
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                if entry.paused {
                    return None;
                }
                match self.strategy {
                    RoutingStrategy::RoundRobin if entry.status == WorkerStatus::Idle => {
                        Some((id.clone(), entry.active_requests))
                    }
                    RoutingStrategy::LeastBusy if entry.status.is_active() => {
                        Some((id.clone(), entry.active_requests))
                    }
                    _ => None,
                }
            })
            .collect();

        if eligible.is_empty() {
            return Err(GantryError::PoolExhausted(
                "no routable workers available".to_string(),
            ));
        }

        let picked = match self.strategy {
            RoutingStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible[idx].0.clone()
            }
            RoutingStrategy::LeastBusy => {
                let min = eligible.iter().map(|(_, a)| *a).min().unwrap_or(0);
                let ties: Vec<&(String, u32)> =
                    eligible.iter().filter(|(_, a)| *a == min).collect();
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % ties.len();
                ties[idx].0.clone()
            }
        };
        Ok(picked)
    }

    /// Increment in-flight accounting; the consumer must pair this
    /// with [`mark_worker_idle`](Self::mark_worker_idle).
    pub fn mark_worker_busy(&self, worker_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.active_requests += 1;
            if entry.status == WorkerStatus::Idle {
                entry.status = WorkerStatus::Busy;
            }
        } else {
            warn!(worker = %worker_id, "mark_worker_busy for unknown worker");
        }
    }

    /// Decrement in-flight accounting; never goes below zero.
    pub fn mark_worker_idle(&self, worker_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(worker_id) {
            entry.active_requests = entry.active_requests.saturating_sub(1);
            if entry.active_requests == 0 && entry.status == WorkerStatus::Busy {
                entry.status = WorkerStatus::Idle;
            }
        }
    }

    pub fn active_requests(&self, worker_id: &str) -> u32 {
        self.entries
            .get(worker_id)
            .map(|e| e.active_requests)
            .unwrap_or(0)
    }

    /// Workers currently idle or busy (and thus routable when unpaused)
    pub fn active_worker_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status.is_active())
            .count()
    }

    /// Sticky sessions currently bound to a worker
    pub fn sticky_count_for(&self, worker_id: &str) -> usize {
        self.sticky
            .iter()
            .filter(|e| e.worker_id == worker_id && e.expires_at > Instant::now())
            .count()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.order
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drop expired sticky entries (periodic maintenance).
    pub fn prune_sticky(&self) {
        let now = Instant::now();
        self.sticky.retain(|_, v| v.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(strategy: RoutingStrategy, workers: &[&str]) -> RuntimeRouter {
        let router = RuntimeRouter::new(strategy);
        for id in workers {
            router.register(id, WorkerStatus::Idle);
        }
        router
    }

    #[test]
    fn test_round_robin_rotates() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0", "w1", "w2"]);
        let a = router.route(None).unwrap();
        router.mark_worker_idle(&a);
        let b = router.route(None).unwrap();
        router.mark_worker_idle(&b);
        let c = router.route(None).unwrap();
        router.mark_worker_idle(&c);
        let mut seen = vec![a, b, c];
        seen.sort();
        assert_eq!(seen, vec!["w0", "w1", "w2"]);
    }

    #[test]
    fn test_round_robin_skips_busy_workers() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0", "w1"]);
        let first = router.route(None).unwrap();
        // first is now busy with one active request; RR only uses idle
        let second = router.route(None).unwrap();
        assert_ne!(first, second);
        let third = router.route(None);
        assert!(third.is_err());
    }

    #[test]
    fn test_least_busy_picks_smallest_load() {
        let router = router_with(RoutingStrategy::LeastBusy, &["w0", "w1"]);
        let a = router.route(None).unwrap();
        // a has 1 active request; least-busy must pick the other
        let b = router.route(None).unwrap();
        assert_ne!(a, b);
        // Both at 1: still routable (busy allowed), one of them returns
        let c = router.route(None).unwrap();
        assert!(c == a || c == b);
    }

    #[test]
    fn test_sticky_session_pins_worker() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0", "w1", "w2"]);
        let first = router.route(Some("stream-1")).unwrap();
        router.mark_worker_idle(&first);
        for _ in 0..5 {
            let again = router.route(Some("stream-1")).unwrap();
            assert_eq!(again, first);
            router.mark_worker_idle(&again);
        }
        assert_eq!(router.sticky_count_for(&first), 1);
    }

    #[test]
    fn test_sticky_expires() {
        let router = RuntimeRouter::new(RoutingStrategy::RoundRobin)
            .with_sticky_ttl(Duration::from_millis(10));
        router.register("w0", WorkerStatus::Idle);
        router.register("w1", WorkerStatus::Idle);

        let first = router.route(Some("stream-1")).unwrap();
        router.mark_worker_idle(&first);
        std::thread::sleep(Duration::from_millis(20));

        // Expired: a new selection happens (rotation moves on)
        let second = router.route(Some("stream-1")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_failed_worker_never_routed() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0"]);
        router.set_status("w0", WorkerStatus::Failed);
        assert!(router.route(None).is_err());
        assert_eq!(router.active_worker_count(), 0);
    }

    #[test]
    fn test_paused_worker_not_routed_even_sticky() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0", "w1"]);
        let pinned = router.route(Some("s")).unwrap();
        router.mark_worker_idle(&pinned);
        router.pause_routing(&pinned);

        let rerouted = router.route(Some("s")).unwrap();
        assert_ne!(rerouted, pinned);

        router.resume_routing(&pinned);
        router.set_status(&pinned, WorkerStatus::Idle);
    }

    #[test]
    fn test_active_requests_never_negative() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0"]);
        router.mark_worker_idle("w0");
        router.mark_worker_idle("w0");
        assert_eq!(router.active_requests("w0"), 0);
    }

    #[test]
    fn test_unregister_clears_sticky() {
        let router = router_with(RoutingStrategy::RoundRobin, &["w0"]);
        let picked = router.route(Some("s1")).unwrap();
        assert_eq!(router.sticky_count_for(&picked), 1);
        router.unregister(&picked);
        assert_eq!(router.sticky_count_for(&picked), 0);
        assert!(router.route(None).is_err());
    }
}
