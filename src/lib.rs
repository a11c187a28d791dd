//! Gantry - orchestration and streaming control plane for model
//! inference workers
//!
//! Gantry sits between client-facing generation requests and a pool of
//! external inference worker processes reached over line-framed
//! JSON-RPC. It manages worker lifecycle, health and rolling upgrades,
//! caches model artifacts, admits and batches requests, multiplexes
//! streaming token output back to callers, and watches its own
//! performance closely enough to open circuit breakers and detect
//! regressions.
//!
//! ## Subsystems
//!
//! - **worker**: pool manager, heartbeat monitoring, restart with
//!   backoff, routing, rolling restarts
//! - **connection**: warmed pool of persistent worker connections
//! - **artifact**: content-addressed on-disk model artifact cache
//! - **model**: load/unload with inflight dedup and a handle LRU
//! - **stream**: stream registry and generator pipeline with pooled
//!   bounded queues
//! - **batch**: request coalescing with adaptive sizing
//! - **breaker**: failure-window circuit breakers
//! - **qos**: metric aggregation, SLO policies, regression detection
//! - **bus**: optional NATS fabric for distributed mode

pub mod artifact;
pub mod batch;
pub mod breaker;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod flags;
pub mod logging;
pub mod model;
pub mod promptcache;
pub mod qos;
pub mod rpc;
pub mod stream;
pub mod types;
pub mod worker;

pub use config::Args;
pub use types::{GantryError, Result};
