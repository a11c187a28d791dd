//! QoS: metric aggregation, SLO policies, regression detection
//!
//! The aggregator is the shared substrate: generation telemetry feeds
//! it, the policy engine evaluates SLOs against its snapshots, and the
//! regression detector compares them to a recorded baseline.

pub mod metrics;
pub mod policy;
pub mod regression;

pub use metrics::{
    AggregatedStats, AnomalyEvent, AnomalySeverity, MetricsAggregator,
    MetricsAggregatorConfig, QuantileSketch,
};
pub use policy::{
    ExecutorConfig, QosEngine, QosEngineConfig, QosEvent, QosPolicy, Remediation,
    RemediationEvent, RemediationExecutor, RemediationOutcome, RemediationSpec, SloDef,
    SloSeverity,
};
pub use regression::{
    AlertSeverity, AutoRollback, BaselineMetrics, CurrentMetrics, RegressionAlert,
    RegressionConfig, RegressionDetector, RegressionEvent, RegressionThresholds,
};
