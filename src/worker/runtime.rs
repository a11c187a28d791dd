//! Worker runtime spawning
//!
//! Launches the external inference runtime as a child process and
//! performs the ready handshake: an `initialize` request that must be
//! answered within the startup timeout. The returned link speaks the
//! line-framed JSON-RPC protocol of [`crate::rpc`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::rpc::messages::methods;
use crate::rpc::{ProcessTransport, TransportConfig, WorkerLink};
use crate::types::{GantryError, Result};

/// Worker runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interpreter executable (e.g. `python3`)
    pub executable: String,
    /// Entry script handed to the interpreter
    pub script: String,
    /// Extra arguments appended after the script
    pub args: Vec<String>,
    /// Ready-handshake budget
    pub startup_timeout: Duration,
    /// Graceful shutdown budget
    pub shutdown_timeout: Duration,
    /// Transport limits
    pub transport: TransportConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
            script: "runtime/worker.py".to_string(),
            args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
        }
    }
}

/// A freshly spawned, initialized worker
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    /// Runtime name reported by the worker during the handshake
    pub runtime: String,
    pub link: Arc<dyn WorkerLink>,
}

/// Seam for worker creation, mocked in tests.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> Result<SpawnedWorker>;
}

/// Spawns real child processes
pub struct ProcessSpawner {
    config: RuntimeConfig,
}

impl ProcessSpawner {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<SpawnedWorker> {
        let mut args = Vec::new();
        if !self.config.script.is_empty() {
            args.push(self.config.script.clone());
        }
        args.extend(self.config.args.iter().cloned());

        debug!(
            executable = %self.config.executable,
            script = %self.config.script,
            "Spawning worker runtime"
        );
        let transport = ProcessTransport::spawn(
            &self.config.executable,
            &args,
            self.config.transport.clone(),
        )?;
        let pid = transport.pid();

        // Ready handshake: worker answers initialize once it can serve
        let init = transport
            .request(
                methods::INITIALIZE,
                json!({ "protocol": "jsonrpc-2.0" }),
                Some(self.config.startup_timeout),
            )
            .await
            .map_err(|e| {
                GantryError::Runtime(format!("worker failed ready handshake: {e}"))
            })?;

        let runtime = init
            .get("runtime")
            .and_then(Value::as_str)
            .unwrap_or("python")
            .to_string();

        info!(pid = ?pid, runtime = %runtime, "Worker runtime ready");
        Ok(SpawnedWorker {
            pid,
            runtime,
            link: Arc::new(transport),
        })
    }
}
