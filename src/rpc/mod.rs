//! Worker RPC layer
//!
//! Line-framed JSON-RPC 2.0 over child-process pipes: typed wire
//! messages, the process transport with id-matched responses and
//! notification fan-out, and a bounded-concurrency request queue.

pub mod messages;
pub mod queue;
pub mod transport;

pub use messages::{Frame, Notification, Request, Response};
pub use queue::{RequestQueue, RequestQueueStats};
pub use transport::{ProcessTransport, TransportConfig, WorkerLink};

/// Test doubles shared across the crate's unit tests.
#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::messages::Notification;
    use super::transport::WorkerLink;
    use crate::types::{GantryError, Result};

    type Handler = dyn Fn(&str, &Value) -> Result<Value> + Send + Sync;

    /// Scriptable in-memory worker link.
    ///
    /// The handler decides each response; notifications are injected
    /// with [`MockWorkerLink::push_notification`]. Every request is
    /// recorded so tests can assert on call counts and payloads.
    pub struct MockWorkerLink {
        handler: Box<Handler>,
        pub calls: std::sync::Mutex<Vec<(String, Value)>>,
        notify_tx: broadcast::Sender<Arc<Notification>>,
        alive: AtomicBool,
        delay: Option<Duration>,
    }

    impl MockWorkerLink {
        pub fn new<H>(handler: H) -> Self
        where
            H: Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
        {
            let (notify_tx, _) = broadcast::channel(256);
            Self {
                handler: Box::new(handler),
                calls: std::sync::Mutex::new(Vec::new()),
                notify_tx,
                alive: AtomicBool::new(true),
                delay: None,
            }
        }

        /// Respond `{}` to everything.
        pub fn ok() -> Self {
            Self::new(|_, _| Ok(Value::Object(serde_json::Map::new())))
        }

        /// Delay every request by `delay` before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn push_notification(&self, method: &str, params: Value) {
            let _ = self.notify_tx.send(Arc::new(Notification::new(method, params)));
        }

        pub fn call_count(&self, method: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .count()
        }

        pub fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::Release);
        }
    }

    #[async_trait]
    impl WorkerLink for MockWorkerLink {
        async fn request(
            &self,
            method: &str,
            params: Value,
            _timeout: Option<Duration>,
        ) -> Result<Value> {
            if !self.is_alive() {
                return Err(GantryError::Runtime("mock worker down".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(method, &params)
        }

        async fn notify(&self, method: &str, params: Value) -> Result<()> {
            if !self.is_alive() {
                return Err(GantryError::Runtime("mock worker down".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
            self.notify_tx.subscribe()
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Acquire)
        }

        async fn shutdown(&self, _budget: Duration) -> Result<()> {
            self.set_alive(false);
            Ok(())
        }
    }
}
