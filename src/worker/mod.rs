//! Worker pool: lifecycle, routing, rolling restarts
//!
//! The manager's worker map is the single source of truth for worker
//! state; the router holds only `{status, active_requests}` snapshots
//! it mutates through explicit calls. Cross-references are by id.

pub mod manager;
pub mod rolling;
pub mod router;
pub mod runtime;

pub use manager::{WorkerEvent, WorkerPoolConfig, WorkerPoolManager, WorkerState};
pub use rolling::{
    ReplayHook, ReplayOutcome, RollingEvent, RollingPhase, RollingRestartConfig,
    RollingRestartCoordinator,
};
pub use router::{RoutingStrategy, RuntimeRouter};
pub use runtime::{ProcessSpawner, RuntimeConfig, SpawnedWorker, WorkerSpawner};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Failed,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl WorkerStatus {
    /// Routable states: only idle and busy workers may serve requests
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}
