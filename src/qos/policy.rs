//! QoS policy engine and remediation executor
//!
//! Enabled policies are evaluated periodically in priority order
//! (higher priority value first). An SLO is violated when the current
//! aggregated value crosses its threshold: higher-is-worse for
//! latency/ttft/error-rate, lower-is-worse for throughput. Transitions
//! emit `PolicyViolation` / `PolicyRecovery` events.
//!
//! Remediations are pluggable actions dispatched by type name. The
//! executor enforces a per-type cooldown, a rolling execution cap, and
//! a loop breaker: repeated triggers without recovery open a local
//! circuit for the policy. Remediation failure is an event, never an
//! error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metrics::MetricsAggregator;
use crate::types::Result;

/// Capacity of the QoS event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Policy model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SloSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct SloDef {
    pub metric: String,
    pub threshold: f64,
    pub window_ms: u64,
    pub severity: SloSeverity,
    pub tenant_id: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemediationSpec {
    /// Action type name: throttle, rollback, restart, ...
    pub action: String,
    pub target: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct QosPolicy {
    pub id: String,
    /// Higher values are evaluated first
    pub priority: u32,
    pub enabled: bool,
    pub slos: Vec<SloDef>,
    pub remediations: Vec<RemediationSpec>,
}

/// Pluggable remediation action
#[async_trait]
pub trait Remediation: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, spec: &RemediationSpec) -> Result<()>;
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Minimum spacing between executions of the same action type
    pub cooldown: Duration,
    /// Rolling execution cap per action type
    pub max_executions_per_window: usize,
    pub execution_window: Duration,
    /// Consecutive triggers without recovery before the local circuit
    /// opens for a policy
    pub loop_detection_window: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_executions_per_window: 5,
            execution_window: Duration::from_secs(600),
            loop_detection_window: 3,
        }
    }
}

/// Outcome of one remediation attempt
#[derive(Debug, Clone)]
pub enum RemediationOutcome {
    Executed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RemediationEvent {
    pub policy_id: String,
    pub action: String,
    pub target: String,
    pub outcome: RemediationOutcome,
}

pub struct RemediationExecutor {
    config: ExecutorConfig,
    actions: DashMap<String, Arc<dyn Remediation>>,
    last_execution: DashMap<String, Instant>,
    history: DashMap<String, VecDeque<Instant>>,
    /// Consecutive violation triggers per policy
    consecutive_triggers: DashMap<String, u32>,
}

impl RemediationExecutor {
    pub fn new(config: ExecutorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            actions: DashMap::new(),
            last_execution: DashMap::new(),
            history: DashMap::new(),
            consecutive_triggers: DashMap::new(),
        })
    }

    /// Register an action implementation under its type name.
    pub fn register(&self, action: Arc<dyn Remediation>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn note_trigger(&self, policy_id: &str) -> u32 {
        let mut count = self
            .consecutive_triggers
            .entry(policy_id.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    pub fn note_recovery(&self, policy_id: &str) {
        self.consecutive_triggers.remove(policy_id);
    }

    fn loop_open(&self, policy_id: &str) -> bool {
        self.consecutive_triggers
            .get(policy_id)
            .map(|c| *c > self.config.loop_detection_window)
            .unwrap_or(false)
    }

    /// Run one remediation under the orchestration contract. Always
    /// returns an event; failures never propagate as errors.
    pub async fn execute(&self, policy_id: &str, spec: &RemediationSpec) -> RemediationEvent {
        let event = |outcome| RemediationEvent {
            policy_id: policy_id.to_string(),
            action: spec.action.clone(),
            target: spec.target.clone(),
            outcome,
        };

        if self.loop_open(policy_id) {
            warn!(policy = %policy_id, action = %spec.action, "Remediation loop detected, circuit open");
            return event(RemediationOutcome::Skipped("loop circuit open".to_string()));
        }

        if let Some(last) = self.last_execution.get(&spec.action) {
            if last.elapsed() < self.config.cooldown {
                return event(RemediationOutcome::Skipped("cooldown".to_string()));
            }
        }

        {
            let mut history = self.history.entry(spec.action.clone()).or_default();
            let now = Instant::now();
            while let Some(front) = history.front() {
                if now.duration_since(*front) > self.config.execution_window {
                    history.pop_front();
                } else {
                    break;
                }
            }
            if history.len() >= self.config.max_executions_per_window {
                return event(RemediationOutcome::Skipped(
                    "execution cap reached".to_string(),
                ));
            }
            history.push_back(now);
        }
        self.last_execution
            .insert(spec.action.clone(), Instant::now());

        let Some(action) = self.actions.get(&spec.action).map(|a| Arc::clone(&a)) else {
            return event(RemediationOutcome::Failed(format!(
                "no remediation registered for '{}'",
                spec.action
            )));
        };

        info!(policy = %policy_id, action = %spec.action, target = %spec.target, "Executing remediation");
        match action.execute(spec).await {
            Ok(()) => event(RemediationOutcome::Executed),
            Err(e) => event(RemediationOutcome::Failed(e.to_string())),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct QosEngineConfig {
    pub evaluation_interval: Duration,
    /// Evaluate without executing remediations
    pub dry_run: bool,
}

impl Default for QosEngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(10),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QosEvent {
    PolicyViolation {
        policy_id: String,
        metric: String,
        value: f64,
        threshold: f64,
        severity: SloSeverity,
    },
    PolicyRecovery {
        policy_id: String,
    },
    Remediation(RemediationEvent),
}

pub struct QosEngine {
    config: QosEngineConfig,
    aggregator: Arc<MetricsAggregator>,
    executor: Arc<RemediationExecutor>,
    policies: RwLock<Vec<QosPolicy>>,
    violating: DashMap<String, ()>,
    events: broadcast::Sender<QosEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl QosEngine {
    pub fn new(
        config: QosEngineConfig,
        aggregator: Arc<MetricsAggregator>,
        executor: Arc<RemediationExecutor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            aggregator,
            executor,
            policies: RwLock::new(Vec::new()),
            violating: DashMap::new(),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QosEvent> {
        self.events.subscribe()
    }

    pub async fn set_policies(&self, mut policies: Vec<QosPolicy>) {
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        *self.policies.write().await = policies;
    }

    pub async fn add_policy(&self, policy: QosPolicy) {
        let mut policies = self.policies.write().await;
        policies.push(policy);
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn active_violations(&self) -> Vec<String> {
        self.violating.iter().map(|e| e.key().clone()).collect()
    }

    /// Evaluate every enabled policy once, in priority order.
    pub async fn evaluate_once(&self) {
        let policies = self.policies.read().await.clone();
        for policy in policies.iter().filter(|p| p.enabled) {
            self.evaluate_policy(policy).await;
        }
    }

    async fn evaluate_policy(&self, policy: &QosPolicy) {
        let mut breached: Option<(&SloDef, f64)> = None;
        for slo in &policy.slos {
            let Some(stats) = self.aggregator.aggregate(&slo.metric) else { continue };
            let value = metric_value(&slo.metric, &stats);
            if is_violated(&slo.metric, value, slo.threshold) {
                breached = Some((slo, value));
                break;
            }
        }

        match breached {
            Some((slo, value)) => {
                let newly = self.violating.insert(policy.id.clone(), ()).is_none();
                if newly {
                    warn!(
                        policy = %policy.id,
                        metric = %slo.metric,
                        value = format!("{value:.3}"),
                        threshold = slo.threshold,
                        "SLO violation"
                    );
                    let _ = self.events.send(QosEvent::PolicyViolation {
                        policy_id: policy.id.clone(),
                        metric: slo.metric.clone(),
                        value,
                        threshold: slo.threshold,
                        severity: slo.severity,
                    });
                }
                self.executor.note_trigger(&policy.id);
                if !self.config.dry_run {
                    for spec in &policy.remediations {
                        let event = self.executor.execute(&policy.id, spec).await;
                        let _ = self.events.send(QosEvent::Remediation(event));
                    }
                } else {
                    debug!(policy = %policy.id, "Dry run, remediations suppressed");
                }
            }
            None => {
                if self.violating.remove(&policy.id).is_some() {
                    info!(policy = %policy.id, "SLO recovered");
                    self.executor.note_recovery(&policy.id);
                    let _ = self.events.send(QosEvent::PolicyRecovery {
                        policy_id: policy.id.clone(),
                    });
                }
            }
        }
    }

    /// Start the periodic evaluator.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.evaluation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.evaluate_once().await;
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Latency-like metrics evaluate at p95; rates and throughput at mean.
fn metric_value(metric: &str, stats: &super::metrics::AggregatedStats) -> f64 {
    if metric.contains("latency") || metric.contains("ttft") {
        stats.p95
    } else {
        stats.mean
    }
}

/// Sense of the comparison depends on the metric: throughput is
/// lower-is-worse, everything else higher-is-worse.
fn is_violated(metric: &str, value: f64, threshold: f64) -> bool {
    if metric.contains("throughput") {
        value < threshold
    } else {
        value > threshold
    }
}
