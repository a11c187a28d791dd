//! Worker process transport
//!
//! Maintains a line-framed JSON-RPC connection over a child process's
//! stdin/stdout. Requests are matched to responses by id through a
//! pending map; notifications (frames without an id) are fanned out to
//! subscribers. Stderr is drained and surfaced in the logs.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::messages::{self, parse_frame, Frame, Notification, Request};
use crate::types::{GantryError, Result};

/// Capacity of the notification fan-out channel
const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default timeout applied when a request has no override
    pub default_timeout: Duration,
    /// Maximum accepted line length in bytes (both directions)
    pub max_line_bytes: usize,
    /// Maximum in-flight requests before new ones are rejected
    pub max_pending: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_line_bytes: 10 * 1024 * 1024,
            max_pending: 1000,
        }
    }
}

/// The seam between the control plane and one worker process.
///
/// Implemented by [`ProcessTransport`] in production and mocked in
/// tests, so pool/model/stream layers never touch a real process.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Issue a request and wait for the matching response.
    async fn request(&self, method: &str, params: Value, timeout: Option<Duration>)
        -> Result<Value>;

    /// Fire-and-forget notification to the worker.
    async fn notify(&self, method: &str, params: Value) -> Result<()>;

    /// Subscribe to notifications emitted by the worker.
    fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>>;

    /// Whether the underlying process is still believed alive.
    fn is_alive(&self) -> bool;

    /// Graceful shutdown: `shutdown` RPC within the budget, then kill.
    async fn shutdown(&self, budget: Duration) -> Result<()>;
}

/// Line-framed JSON-RPC transport over a child process
pub struct ProcessTransport {
    stdin_tx: mpsc::Sender<String>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    notify_tx: broadcast::Sender<Arc<Notification>>,
    alive: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    config: TransportConfig,
}

impl ProcessTransport {
    /// Spawn the worker process and wire up reader/writer tasks.
    pub fn spawn(
        executable: &str,
        args: &[String],
        config: TransportConfig,
    ) -> Result<Self> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GantryError::Runtime(format!("failed to spawn worker: {e}")))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GantryError::Runtime("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GantryError::Runtime("worker stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GantryError::Runtime("worker stderr unavailable".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        let pending: Arc<DashMap<u64, oneshot::Sender<Result<Value>>>> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        // Writer: serializes all outgoing frames onto stdin
        let alive_writer = Arc::clone(&alive);
        tokio::spawn(writer_loop(stdin, stdin_rx, alive_writer));

        // Reader: matches responses, fans out notifications
        let pending_reader = Arc::clone(&pending);
        let alive_reader = Arc::clone(&alive);
        let notify_reader = notify_tx.clone();
        let max_line = config.max_line_bytes;
        tokio::spawn(async move {
            reader_loop(stdout, pending_reader, notify_reader, max_line).await;
            alive_reader.store(false, Ordering::Release);
        });

        // Stderr drain
        tokio::spawn(stderr_loop(stderr, pid));

        Ok(Self {
            stdin_tx,
            pending,
            next_id: AtomicU64::new(1),
            notify_tx,
            alive,
            child: Mutex::new(Some(child)),
            pid,
            config,
        })
    }

    /// OS process id of the worker, if the spawn reported one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn send_line(&self, line: String) -> Result<()> {
        if line.len() > self.config.max_line_bytes {
            return Err(GantryError::Validation(format!(
                "frame of {} bytes exceeds max line size {}",
                line.len(),
                self.config.max_line_bytes
            )));
        }
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| GantryError::Runtime("worker connection closed".to_string()))
    }

    /// Kill the process immediately, failing all pending requests.
    pub async fn kill(&self) -> Result<()> {
        self.alive.store(false, Ordering::Release);
        fail_all_pending(&self.pending, "worker killed");
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerLink for ProcessTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(GantryError::Runtime("worker is not running".to_string()));
        }
        if self.pending.len() >= self.config.max_pending {
            return Err(GantryError::Runtime(format!(
                "too many pending requests ({})",
                self.config.max_pending
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&Request::new(id, method, params))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(id, response_tx);

        if let Err(e) = self.send_line(line).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let deadline = timeout_override.unwrap_or(self.config.default_timeout);
        match timeout(deadline, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GantryError::Runtime(
                "response channel closed".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(GantryError::Timeout(format!(
                    "{method} timed out after {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let line = serde_json::to_string(&Notification::new(method, params))?;
        self.send_line(line).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.notify_tx.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn shutdown(&self, budget: Duration) -> Result<()> {
        if self.is_alive() {
            match self
                .request(messages::methods::SHUTDOWN, Value::Null, Some(budget))
                .await
            {
                Ok(_) => debug!(pid = ?self.pid, "Worker acknowledged shutdown"),
                Err(e) => warn!(pid = ?self.pid, error = %e, "Graceful shutdown failed, killing"),
            }
        }
        self.kill().await
    }
}

/// Writer side: one frame per line onto the worker's stdin
async fn writer_loop(
    stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
    alive: Arc<AtomicBool>,
) {
    let mut stdin = stdin;
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write to worker stdin");
            alive.store(false, Ordering::Release);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(error = %e, "Failed to flush worker stdin");
            alive.store(false, Ordering::Release);
            break;
        }
    }
}

/// Reader side: parse frames, settle pending requests, fan out
/// notifications. Returns when the worker closes its stdout.
async fn reader_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Value>>>>,
    notify_tx: broadcast::Sender<Arc<Notification>>,
    max_line_bytes: usize,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if line.len() > max_line_bytes {
                    warn!(len = line.len(), "Dropping oversized worker frame");
                    continue;
                }
                match parse_frame(&line) {
                    Ok(Frame::Response(response)) => {
                        let Some((_, sender)) = pending.remove(&response.id) else {
                            debug!(id = response.id, "Response for unknown request id (timed out?)");
                            continue;
                        };
                        let outcome = match response.error {
                            Some(err) => Err(GantryError::Runtime(format!(
                                "worker error {}: {}",
                                err.code, err.message
                            ))),
                            None => Ok(response.result.unwrap_or(Value::Null)),
                        };
                        let _ = sender.send(outcome);
                    }
                    Ok(Frame::Notification(notification)) => {
                        // No subscribers is fine; streams may not be attached yet
                        let _ = notify_tx.send(Arc::new(notification));
                    }
                    Err(e) => {
                        warn!(error = %e, "Unparseable worker frame (skipping)");
                    }
                }
            }
            Ok(None) => {
                debug!("Worker stdout closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Worker stdout read error");
                break;
            }
        }
    }

    fail_all_pending(&pending, "worker connection closed");
}

/// Stderr drain: surfaces worker-side diagnostics in our logs
async fn stderr_loop(stderr: tokio::process::ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!(pid = ?pid, "worker stderr: {}", line);
        }
    }
}

fn fail_all_pending(
    pending: &DashMap<u64, oneshot::Sender<Result<Value>>>,
    reason: &str,
) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, sender)) = pending.remove(&id) {
            let _ = sender.send(Err(GantryError::Runtime(reason.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // `cat` echoes each request line back; the echoed frame carries the
    // request id and parses as a response with no result payload.
    fn spawn_cat() -> ProcessTransport {
        ProcessTransport::spawn("cat", &[], TransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_id_matching() {
        let transport = spawn_cat();
        let result = transport
            .request("tokenize", json!({"text": "hi"}), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(transport.pending_count(), 0);
        transport.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_fan_out() {
        // Delay the emission so the subscription below is in place
        let script = r#"sleep 0.3; echo '{"jsonrpc":"2.0","method":"stream.chunk","params":{"stream_id":"s1","token":"a"}}'; sleep 1"#;
        let transport = ProcessTransport::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            TransportConfig::default(),
        )
        .unwrap();

        let mut rx = transport.subscribe();
        let notification = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notification within deadline")
            .unwrap();
        assert_eq!(notification.method, "stream.chunk");
        assert_eq!(notification.stream_id(), Some("s1"));
        transport.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_exit_fails_pending() {
        // Worker that never answers and exits immediately
        let transport = ProcessTransport::spawn("true", &[], TransportConfig::default()).unwrap();
        let result = transport
            .request("load_model", json!({}), Some(Duration::from_secs(5)))
            .await;
        assert!(result.is_err());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_pending() {
        // `sleep` consumes stdin without ever responding
        let transport = ProcessTransport::spawn(
            "sleep",
            &["5".to_string()],
            TransportConfig::default(),
        )
        .unwrap();
        let result = transport
            .request("generate", json!({}), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(GantryError::Timeout(_))));
        assert_eq!(transport.pending_count(), 0);
        transport.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let config = TransportConfig {
            max_line_bytes: 64,
            ..TransportConfig::default()
        };
        let transport = ProcessTransport::spawn("cat", &[], config).unwrap();
        let big_prompt = "x".repeat(256);
        let result = transport
            .request("generate", json!({"prompt": big_prompt}), None)
            .await;
        assert!(matches!(result, Err(GantryError::Validation(_))));
        assert_eq!(transport.pending_count(), 0);
        transport.kill().await.unwrap();
    }
}
