//! Metrics aggregation
//!
//! Per metric name: a time-bounded sliding window of samples, with
//! quantiles computed through a merging digest (compression near 100)
//! built over the live window so percentiles recover as samples age
//! out. The aggregation task periodically publishes
//! `{count, min, max, mean, median, p50, p95, p99, stddev}` snapshots
//! that the policy engine and regression detector read.
//!
//! Anomaly detection: a sample deviating from the window mean by more
//! than `anomaly_sigma` standard deviations (with enough samples
//! present) emits an [`AnomalyEvent`]: high above 4 sigma, medium above
//! 3σ, low below that.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Buffered samples before a sketch compression pass
const SKETCH_BUFFER: usize = 32;

/// Hard cap on windowed samples per metric
const MAX_WINDOW_SAMPLES: usize = 10_000;

/// Capacity of the anomaly event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Quantile sketch
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Merging quantile digest. Centroid count is bounded by the
/// compression parameter; accuracy is roughly 1/compression in
/// quantile space.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
}

impl QuantileSketch {
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(10.0),
            centroids: Vec::new(),
            buffer: Vec::with_capacity(SKETCH_BUFFER),
            count: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.buffer.push(value);
        self.count += 1;
        if self.buffer.len() >= SKETCH_BUFFER {
            self.compress();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut merged: Vec<Centroid> = self
            .centroids
            .drain(..)
            .chain(self.buffer.drain(..).map(|v| Centroid { mean: v, weight: 1.0 }))
            .collect();
        merged.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = merged.iter().map(|c| c.weight).sum();
        let limit = (total / self.compression).max(1.0);

        let mut out: Vec<Centroid> = Vec::with_capacity(self.compression as usize + 1);
        for centroid in merged {
            match out.last_mut() {
                Some(last) if last.weight + centroid.weight <= limit => {
                    let weight = last.weight + centroid.weight;
                    last.mean =
                        (last.mean * last.weight + centroid.mean * centroid.weight) / weight;
                    last.weight = weight;
                }
                _ => out.push(centroid),
            }
        }
        self.centroids = out;
    }

    /// Approximate value at quantile `q` in [0, 1].
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.compress();
        if self.centroids.is_empty() {
            return None;
        }
        let total: f64 = self.centroids.iter().map(|c| c.weight).sum();
        let target = q.clamp(0.0, 1.0) * total;

        let mut cumulative = 0.0;
        for centroid in &self.centroids {
            cumulative += centroid.weight;
            if cumulative >= target {
                return Some(centroid.mean);
            }
        }
        self.centroids.last().map(|c| c.mean)
    }
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Debug, Clone)]
pub struct MetricsAggregatorConfig {
    /// Sliding window span
    pub window: Duration,
    /// Snapshot publication cadence
    pub aggregation_interval: Duration,
    /// Samples required before anomaly detection runs
    pub min_samples_for_detection: usize,
    /// Deviation threshold in standard deviations
    pub anomaly_sigma: f64,
    /// Sketch compression parameter
    pub compression: f64,
}

impl Default for MetricsAggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            aggregation_interval: Duration::from_secs(10),
            min_samples_for_detection: 10,
            anomaly_sigma: 3.0,
            compression: 100.0,
        }
    }
}

/// Snapshot of one metric over the current window
#[derive(Debug, Clone, Default)]
pub struct AggregatedStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
}

/// Anomaly severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub metric: String,
    pub value: f64,
    pub mean: f64,
    pub stddev: f64,
    pub sigma: f64,
    pub severity: AnomalySeverity,
}

struct MetricSeries {
    window: VecDeque<(Instant, f64)>,
}

pub struct MetricsAggregator {
    config: MetricsAggregatorConfig,
    series: DashMap<String, MetricSeries>,
    latest: DashMap<String, AggregatedStats>,
    anomalies: broadcast::Sender<AnomalyEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsAggregatorConfig) -> Arc<Self> {
        let (anomalies, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            series: DashMap::new(),
            latest: DashMap::new(),
            anomalies,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.anomalies.subscribe()
    }

    /// Record one sample.
    pub fn record(&self, metric: &str, value: f64) {
        if !value.is_finite() {
            warn!(metric, value, "Dropping non-finite metric sample");
            return;
        }
        let now = Instant::now();
        let mut entry = self
            .series
            .entry(metric.to_string())
            .or_insert_with(|| MetricSeries {
                window: VecDeque::new(),
            });

        Self::prune(&mut entry.window, now, self.config.window);

        // Anomaly check against the window before this sample joins it
        if entry.window.len() >= self.config.min_samples_for_detection {
            let (mean, stddev) = mean_stddev(entry.window.iter().map(|(_, v)| *v));
            if stddev > 0.0 {
                let sigma = (value - mean).abs() / stddev;
                if sigma > self.config.anomaly_sigma {
                    let severity = if sigma >= 4.0 {
                        AnomalySeverity::High
                    } else if sigma >= 3.0 {
                        AnomalySeverity::Medium
                    } else {
                        AnomalySeverity::Low
                    };
                    debug!(metric, value, sigma = format!("{sigma:.1}"), "Metric anomaly");
                    let _ = self.anomalies.send(AnomalyEvent {
                        metric: metric.to_string(),
                        value,
                        mean,
                        stddev,
                        sigma,
                        severity,
                    });
                }
            }
        }

        entry.window.push_back((now, value));
        while entry.window.len() > MAX_WINDOW_SAMPLES {
            entry.window.pop_front();
        }
    }

    fn prune(window: &mut VecDeque<(Instant, f64)>, now: Instant, span: Duration) {
        while let Some((t, _)) = window.front() {
            if now.duration_since(*t) > span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Compute a fresh snapshot for one metric.
    pub fn aggregate(&self, metric: &str) -> Option<AggregatedStats> {
        let mut entry = self.series.get_mut(metric)?;
        let now = Instant::now();
        Self::prune(&mut entry.window, now, self.config.window);
        if entry.window.is_empty() {
            return None;
        }

        let values: Vec<f64> = entry.window.iter().map(|(_, v)| *v).collect();
        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (mean, stddev) = mean_stddev(values.iter().copied());

        // Quantiles come from a digest over the live window, so they
        // recover as old samples age out
        let mut sketch = QuantileSketch::new(self.config.compression);
        for value in &values {
            sketch.add(*value);
        }
        let p50 = sketch.quantile(0.50).unwrap_or(mean);
        let p95 = sketch.quantile(0.95).unwrap_or(max);
        let p99 = sketch.quantile(0.99).unwrap_or(max);

        Some(AggregatedStats {
            count,
            min,
            max,
            mean,
            median: p50,
            p50,
            p95,
            p99,
            stddev,
        })
    }

    /// Last published snapshot for a metric.
    pub fn latest(&self, metric: &str) -> Option<AggregatedStats> {
        self.latest.get(metric).map(|s| s.clone())
    }

    /// Publish snapshots for every known metric.
    pub fn publish_snapshots(&self) {
        let metrics: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        for metric in metrics {
            if let Some(stats) = self.aggregate(&metric) {
                self.latest.insert(metric, stats);
            }
        }
    }

    /// Start the periodic aggregation task.
    pub fn start(self: &Arc<Self>) {
        let aggregator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.config.aggregation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                aggregator.publish_snapshots();
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

fn mean_stddev(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let count = values.clone().count();
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / count as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sketch_quantiles_on_uniform_data() {
        let mut sketch = QuantileSketch::new(100.0);
        for i in 0..10_000 {
            sketch.add(i as f64);
        }
        let p50 = sketch.quantile(0.5).unwrap();
        let p95 = sketch.quantile(0.95).unwrap();
        let p99 = sketch.quantile(0.99).unwrap();

        assert!((p50 - 5000.0).abs() < 500.0, "p50 {p50}");
        assert!((p95 - 9500.0).abs() < 500.0, "p95 {p95}");
        assert!((p99 - 9900.0).abs() < 500.0, "p99 {p99}");
        // Centroid count stays on the order of the compression factor
        assert!(sketch.centroids.len() <= 200);
    }

    #[test]
    fn test_sketch_ignores_non_finite() {
        let mut sketch = QuantileSketch::new(100.0);
        sketch.add(f64::NAN);
        sketch.add(f64::INFINITY);
        sketch.add(1.0);
        assert_eq!(sketch.count(), 1);
        assert_eq!(sketch.quantile(0.5), Some(1.0));
    }

    #[test]
    fn test_aggregate_basic_stats() {
        let aggregator = MetricsAggregator::new(MetricsAggregatorConfig::default());
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            aggregator.record("latency", v);
        }
        let stats = aggregator.aggregate("latency").unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert!((stats.mean - 3.0).abs() < f64::EPSILON);
        assert!(stats.stddev > 1.0 && stats.stddev < 2.0);
    }

    #[test]
    fn test_window_prunes_old_samples() {
        let aggregator = MetricsAggregator::new(MetricsAggregatorConfig {
            window: Duration::from_millis(20),
            ..MetricsAggregatorConfig::default()
        });
        aggregator.record("m", 100.0);
        std::thread::sleep(Duration::from_millis(40));
        aggregator.record("m", 1.0);
        let stats = aggregator.aggregate("m").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.mean, 1.0);
    }

    #[test]
    fn test_anomaly_detection_with_severity() {
        let aggregator = MetricsAggregator::new(MetricsAggregatorConfig {
            min_samples_for_detection: 10,
            ..MetricsAggregatorConfig::default()
        });
        let mut events = aggregator.subscribe_anomalies();

        // Stable series with slight jitter so stddev is non-zero
        for i in 0..20 {
            aggregator.record("latency", 100.0 + (i % 2) as f64);
        }
        // Far outlier
        aggregator.record("latency", 500.0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.metric, "latency");
        assert_eq!(event.value, 500.0);
        assert_eq!(event.severity, AnomalySeverity::High);
    }

    #[test]
    fn test_no_anomaly_below_min_samples() {
        let aggregator = MetricsAggregator::new(MetricsAggregatorConfig {
            min_samples_for_detection: 10,
            ..MetricsAggregatorConfig::default()
        });
        let mut events = aggregator.subscribe_anomalies();
        for _ in 0..5 {
            aggregator.record("m", 1.0);
        }
        aggregator.record("m", 1000.0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_publish_and_latest() {
        let aggregator = MetricsAggregator::new(MetricsAggregatorConfig::default());
        aggregator.record("throughput", 100.0);
        assert!(aggregator.latest("throughput").is_none());
        aggregator.publish_snapshots();
        let stats = aggregator.latest("throughput").unwrap();
        assert_eq!(stats.count, 1);
    }
}
