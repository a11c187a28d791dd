//! Circuit breaker gating worker calls
//!
//! Failure-rate-driven state machine over a rolling window of failure
//! timestamps:
//!
//! - **Closed**: calls pass; reaching `failure_threshold` failures
//!   inside `failure_window` opens the circuit.
//! - **Open**: calls are rejected with a `retry_after_ms` hint until
//!   `recovery_timeout` has elapsed, then the circuit half-opens.
//! - **Half-open**: at most `half_open_max_calls` trial calls run at a
//!   time; `half_open_success_threshold` successes close the circuit,
//!   any failure re-opens it.
//!
//! Open → half-open happens both on entry (time check) and via a
//! scheduled one-shot task, so recovery works with and without traffic.
//! Every transition emits a [`StateChangeEvent`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::types::{GantryError, Result};

/// Capacity of the state-change event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Name used in events and logs
    pub name: String,
    /// Failures within the window before the circuit opens
    pub failure_threshold: usize,
    /// Open → half-open delay
    pub recovery_timeout: Duration,
    /// Concurrent trial calls allowed while half-open
    pub half_open_max_calls: usize,
    /// Successes in half-open required to close
    pub half_open_success_threshold: usize,
    /// Rolling failure window
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            half_open_success_threshold: 2,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Emitted on every state transition
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub name: String,
    pub previous: CircuitState,
    pub next: CircuitState,
    pub reason: String,
    pub failure_count: usize,
    pub timestamp: DateTime<Utc>,
}

struct BreakerInner {
    state: CircuitState,
    /// Failure instants inside the rolling window, oldest first
    failures: VecDeque<Instant>,
    /// Trial calls currently in flight while half-open
    half_open_attempts: usize,
    half_open_successes: usize,
    opened_at: Option<Instant>,
    /// Invalidates stale recovery timers after manual transitions
    generation: u64,
}

/// Circuit breaker instance
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    events: broadcast::Sender<StateChangeEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                half_open_attempts: 0,
                half_open_successes: 0,
                opened_at: None,
                generation: 0,
            })),
            events,
        }
    }

    /// Subscribe to state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.events.subscribe()
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Failures currently inside the rolling window
    pub async fn failure_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner.failures, self.config.failure_window);
        inner.failures.len()
    }

    /// Run `op` under the breaker's gate.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit().await?;

        let was_half_open = {
            let inner = self.inner.lock().await;
            inner.state == CircuitState::HalfOpen
        };

        let result = op().await;

        match &result {
            Ok(_) => self.on_success().await,
            Err(_) => self.on_failure().await,
        }

        if was_half_open {
            let mut inner = self.inner.lock().await;
            inner.half_open_attempts = inner.half_open_attempts.saturating_sub(1);
        }

        result
    }

    /// Gate check; counts a half-open attempt when admitted in that state.
    async fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout elapsed");
            } else {
                let retry_after_ms =
                    (self.config.recovery_timeout - elapsed).as_millis() as u64;
                return Err(GantryError::CircuitOpen { retry_after_ms });
            }
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_attempts >= self.config.half_open_max_calls {
                return Err(GantryError::CircuitOpen { retry_after_ms: 0 });
            }
            inner.half_open_attempts += 1;
        }

        Ok(())
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, "half-open successes");
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures.push_back(Instant::now());
        Self::prune(&mut inner.failures, self.config.failure_window);

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "half-open failure");
                self.schedule_recovery(&inner);
            }
            CircuitState::Closed => {
                if inner.failures.len() >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, "failure threshold reached");
                    self.schedule_recovery(&inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Administrative: clear everything and close.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures.clear();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "reset");
        }
    }

    /// Administrative: open regardless of failures.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open, "forced open");
        } else {
            // Re-arm the open window
            inner.opened_at = Some(Instant::now());
            inner.generation += 1;
        }
    }

    /// Administrative: close regardless of failures.
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures.clear();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "forced close");
        }
    }

    fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = failures.front() {
            if now.duration_since(*front) > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState, reason: &str) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        inner.state = next;
        inner.generation += 1;

        match next {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.config.name,
                    failures = inner.failures.len(),
                    reason = reason,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
                info!(breaker = %self.config.name, "Circuit half-open");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
                info!(breaker = %self.config.name, reason = reason, "Circuit closed");
            }
        }

        let _ = self.events.send(StateChangeEvent {
            name: self.config.name.clone(),
            previous,
            next,
            reason: reason.to_string(),
            failure_count: inner.failures.len(),
            timestamp: Utc::now(),
        });
    }

    /// One-shot task transitioning open → half-open after the recovery
    /// timeout, so recovery happens even without incoming traffic. A
    /// generation check drops stale timers.
    fn schedule_recovery(&self, inner: &BreakerInner) {
        let generation = inner.generation;
        let shared = Arc::clone(&self.inner);
        let recovery = self.config.recovery_timeout;
        let name = self.config.name.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(recovery).await;
            let mut inner = shared.lock().await;
            if inner.state == CircuitState::Open && inner.generation == generation {
                let previous = inner.state;
                inner.state = CircuitState::HalfOpen;
                inner.generation += 1;
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
                debug!(breaker = %name, "Circuit half-open (recovery timer)");
                let _ = events.send(StateChangeEvent {
                    name,
                    previous,
                    next: CircuitState::HalfOpen,
                    reason: "recovery timer".to_string(),
                    failure_count: inner.failures.len(),
                    timestamp: Utc::now(),
                });
            }
        });
    }
}

/// Named breakers, one per worker (or other gated resource)
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    template: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(template: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            template,
        }
    }

    /// Get or create the breaker with the given name
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = BreakerConfig {
                    name: name.to_string(),
                    ..self.template.clone()
                };
                Arc::new(CircuitBreaker::new(config))
            })
            .clone()
    }

    /// Drop a breaker (worker removed)
    pub fn remove(&self, name: &str) {
        self.breakers.remove(name);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
