//! Regression detector
//!
//! Compares current performance against a recorded baseline on a fixed
//! cadence. Alert rules:
//!
//! - throughput drop beyond the threshold: critical, rollback
//! - TTFT (p95) increase beyond the threshold: critical, rollback
//! - error rate above the absolute threshold: critical, rollback
//! - p99 latency increase beyond the threshold: warning, monitor
//!
//! With no baseline the detector is inert. Alert history is bounded to
//! the last 100 alerts. Auto-rollback, when enabled, emits a rollback
//! event (optionally only when a critical alert is present).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metrics::MetricsAggregator;

/// Bounded alert history
const MAX_ALERT_HISTORY: usize = 100;

/// Capacity of the regression event channel
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Metric names the detector reads from the aggregator
pub mod metric_names {
    pub const THROUGHPUT: &str = "throughput";
    pub const TTFT: &str = "ttft";
    pub const ERROR_RATE: &str = "error_rate";
    pub const LATENCY: &str = "latency";
}

/// Reference performance snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineMetrics {
    pub throughput: f64,
    pub ttft: f64,
    /// Fraction in [0, 1]
    pub error_rate: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Current snapshot assembled from the aggregator
#[derive(Debug, Clone, Default)]
pub struct CurrentMetrics {
    pub throughput: f64,
    pub ttft: f64,
    pub error_rate: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
}

#[derive(Debug, Clone)]
pub struct RegressionThresholds {
    pub throughput_drop_percent: f64,
    pub ttft_increase_percent: f64,
    /// Absolute error-rate bound, in percent
    pub error_rate_percent: f64,
    pub p99_latency_increase_percent: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            throughput_drop_percent: 10.0,
            ttft_increase_percent: 20.0,
            error_rate_percent: 1.0,
            p99_latency_increase_percent: 25.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoRollback {
    pub enabled: bool,
    /// Only roll back when at least one critical alert fired
    pub on_critical_only: bool,
}

impl Default for AutoRollback {
    fn default() -> Self {
        Self {
            enabled: false,
            on_critical_only: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegressionConfig {
    pub check_interval: Duration,
    pub min_samples_for_evaluation: usize,
    pub thresholds: RegressionThresholds,
    pub auto_rollback: AutoRollback,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            min_samples_for_evaluation: 10,
            thresholds: RegressionThresholds::default(),
            auto_rollback: AutoRollback::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct RegressionAlert {
    pub metric: String,
    pub severity: AlertSeverity,
    /// rollback | monitor
    pub action: String,
    pub percent_change: f64,
    pub current: f64,
    pub baseline: f64,
}

#[derive(Debug, Clone)]
pub enum RegressionEvent {
    Regression {
        alerts: Vec<RegressionAlert>,
        current: CurrentMetrics,
        baseline: BaselineMetrics,
    },
    Alert(RegressionAlert),
    Rollback {
        reason: String,
    },
}

pub struct RegressionDetector {
    config: RegressionConfig,
    aggregator: Arc<MetricsAggregator>,
    baseline: RwLock<Option<BaselineMetrics>>,
    history: Mutex<VecDeque<RegressionAlert>>,
    active_violations: DashMap<String, RegressionAlert>,
    events: broadcast::Sender<RegressionEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RegressionDetector {
    pub fn new(config: RegressionConfig, aggregator: Arc<MetricsAggregator>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            aggregator,
            baseline: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            active_violations: DashMap::new(),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegressionEvent> {
        self.events.subscribe()
    }

    pub async fn set_baseline(&self, baseline: BaselineMetrics) {
        info!(
            throughput = baseline.throughput,
            ttft = baseline.ttft,
            "Regression baseline set"
        );
        *self.baseline.write().await = Some(baseline);
    }

    pub async fn baseline(&self) -> Option<BaselineMetrics> {
        self.baseline.read().await.clone()
    }

    /// Record the current metrics as the new baseline.
    pub async fn capture_baseline(&self, version: Option<String>) -> Option<BaselineMetrics> {
        let current = self.snapshot_current()?;
        let baseline = BaselineMetrics {
            throughput: current.throughput,
            ttft: current.ttft,
            error_rate: current.error_rate,
            latency_p95: current.latency_p95,
            latency_p99: current.latency_p99,
            timestamp: Utc::now(),
            version,
        };
        self.set_baseline(baseline.clone()).await;
        Some(baseline)
    }

    pub fn active_violations(&self) -> Vec<RegressionAlert> {
        self.active_violations.iter().map(|e| e.clone()).collect()
    }

    pub async fn alert_history(&self) -> Vec<RegressionAlert> {
        self.history.lock().await.iter().cloned().collect()
    }

    fn snapshot_current(&self) -> Option<CurrentMetrics> {
        let throughput = self.aggregator.aggregate(metric_names::THROUGHPUT)?;
        if throughput.count < self.config.min_samples_for_evaluation {
            return None;
        }
        let ttft = self.aggregator.aggregate(metric_names::TTFT);
        let error_rate = self.aggregator.aggregate(metric_names::ERROR_RATE);
        let latency = self.aggregator.aggregate(metric_names::LATENCY);

        Some(CurrentMetrics {
            throughput: throughput.mean,
            ttft: ttft.as_ref().map(|s| s.p95).unwrap_or(0.0),
            error_rate: error_rate.as_ref().map(|s| s.mean).unwrap_or(0.0),
            latency_p95: latency.as_ref().map(|s| s.p95).unwrap_or(0.0),
            latency_p99: latency.as_ref().map(|s| s.p99).unwrap_or(0.0),
        })
    }

    /// One comparison pass. No baseline or not enough samples → skip.
    pub async fn check_once(&self) {
        let Some(baseline) = self.baseline().await else { return };
        let Some(current) = self.snapshot_current() else {
            debug!("Regression check skipped (insufficient samples)");
            return;
        };

        let thresholds = &self.config.thresholds;
        let mut alerts: Vec<RegressionAlert> = Vec::new();

        if baseline.throughput > 0.0 {
            let drop_percent =
                (baseline.throughput - current.throughput) / baseline.throughput * 100.0;
            if drop_percent >= thresholds.throughput_drop_percent {
                alerts.push(RegressionAlert {
                    metric: metric_names::THROUGHPUT.to_string(),
                    severity: AlertSeverity::Critical,
                    action: "rollback".to_string(),
                    percent_change: -drop_percent,
                    current: current.throughput,
                    baseline: baseline.throughput,
                });
            }
        }

        if baseline.ttft > 0.0 && current.ttft > 0.0 {
            let increase_percent = (current.ttft - baseline.ttft) / baseline.ttft * 100.0;
            if increase_percent >= thresholds.ttft_increase_percent {
                alerts.push(RegressionAlert {
                    metric: metric_names::TTFT.to_string(),
                    severity: AlertSeverity::Critical,
                    action: "rollback".to_string(),
                    percent_change: increase_percent,
                    current: current.ttft,
                    baseline: baseline.ttft,
                });
            }
        }

        if current.error_rate * 100.0 > thresholds.error_rate_percent {
            alerts.push(RegressionAlert {
                metric: metric_names::ERROR_RATE.to_string(),
                severity: AlertSeverity::Critical,
                action: "rollback".to_string(),
                percent_change: (current.error_rate - baseline.error_rate) * 100.0,
                current: current.error_rate,
                baseline: baseline.error_rate,
            });
        }

        if baseline.latency_p99 > 0.0 && current.latency_p99 > 0.0 {
            let increase_percent =
                (current.latency_p99 - baseline.latency_p99) / baseline.latency_p99 * 100.0;
            if increase_percent >= thresholds.p99_latency_increase_percent {
                alerts.push(RegressionAlert {
                    metric: metric_names::LATENCY.to_string(),
                    severity: AlertSeverity::Warning,
                    action: "monitor".to_string(),
                    percent_change: increase_percent,
                    current: current.latency_p99,
                    baseline: baseline.latency_p99,
                });
            }
        }

        // Recovery: metrics without a fresh alert drop out of the
        // active set
        let alerted: Vec<String> = alerts.iter().map(|a| a.metric.clone()).collect();
        let recovered: Vec<String> = self
            .active_violations
            .iter()
            .filter(|e| !alerted.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for metric in recovered {
            self.active_violations.remove(&metric);
            info!(metric = %metric, "Regression recovered");
        }

        if alerts.is_empty() {
            return;
        }

        warn!(alerts = alerts.len(), "Performance regression detected");
        let _ = self.events.send(RegressionEvent::Regression {
            alerts: alerts.clone(),
            current: current.clone(),
            baseline: baseline.clone(),
        });

        let mut history = self.history.lock().await;
        for alert in &alerts {
            self.active_violations
                .insert(alert.metric.clone(), alert.clone());
            history.push_back(alert.clone());
            while history.len() > MAX_ALERT_HISTORY {
                history.pop_front();
            }
            let _ = self.events.send(RegressionEvent::Alert(alert.clone()));
        }
        drop(history);

        let has_critical = alerts.iter().any(|a| a.severity == AlertSeverity::Critical);
        let rollback = self.config.auto_rollback.enabled
            && (!self.config.auto_rollback.on_critical_only || has_critical);
        if rollback {
            let reason = alerts
                .iter()
                .map(|a| format!("{} {:+.1}%", a.metric, a.percent_change))
                .collect::<Vec<_>>()
                .join(", ");
            warn!(reason = %reason, "Auto-rollback triggered");
            let _ = self.events.send(RegressionEvent::Rollback { reason });
        }
    }

    /// Start the periodic checker.
    pub fn start(self: &Arc<Self>) {
        let detector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                detector.check_once().await;
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
