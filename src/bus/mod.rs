//! NATS message bus for distributed mode
//!
//! Publish/subscribe plus request/reply with JSON payloads. Subjects:
//!
//! - `worker.<id>.inference`: inference dispatch to a remote worker
//! - `response.<request_id>`: reply subject for a dispatched request
//! - `worker.heartbeat`: liveness reports from every node
//!
//! Reply timeouts default to 5 seconds. The bus is optional: a node
//! without NATS runs single-node with in-process routing only.

use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::types::{GantryError, Result};

/// Default request timeout for RPC-style calls
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Subject helpers
pub mod subjects {
    pub fn worker_inference(worker_id: &str) -> String {
        format!("worker.{worker_id}.inference")
    }

    pub fn response(request_id: &str) -> String {
        format!("response.{request_id}")
    }

    pub const WORKER_HEARTBEAT: &str = "worker.heartbeat";
}

/// NATS connection configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// NATS client wrapper with request/reply timeouts
#[derive(Clone)]
pub struct BusClient {
    client: Client,
    request_timeout: Duration,
    name: String,
}

impl BusClient {
    /// Connect with fast failure; reconnection still works after the
    /// initial successful connection.
    pub async fn connect(config: &BusConfig, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| GantryError::Bus(format!("failed to connect: {e}")))?;

        info!("Connected to NATS at {}", config.url);
        Ok(Self {
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            name: name.to_string(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a JSON payload.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publish(subject, Bytes::from(bytes)).await
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| GantryError::Bus(format!("publish failed: {e}")))
    }

    /// Request/reply with the configured timeout.
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes> {
        let message = tokio::time::timeout(
            self.request_timeout,
            self.client.request(subject.to_string(), payload),
        )
        .await
        .map_err(|_| GantryError::Timeout(format!("request to {subject} timed out")))?
        .map_err(|e| GantryError::Bus(format!("request failed: {e}")))?;
        Ok(message.payload)
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| GantryError::Bus(format!("subscribe failed: {e}")))
    }

    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| GantryError::Bus(format!("flush failed: {e}")))
    }
}

/// Heartbeat payload published on `worker.heartbeat`
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: String,
    pub active_workers: usize,
    pub active_streams: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Periodically publish this node's heartbeat.
pub fn spawn_heartbeat_publisher(
    bus: BusClient,
    node_id: String,
    interval: Duration,
    snapshot: impl Fn() -> (usize, usize) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (active_workers, active_streams) = snapshot();
            let heartbeat = NodeHeartbeat {
                node_id: node_id.clone(),
                active_workers,
                active_streams,
                timestamp: chrono::Utc::now(),
            };
            if let Err(e) = bus
                .publish_json(subjects::WORKER_HEARTBEAT, &heartbeat)
                .await
            {
                warn!(error = %e, "Heartbeat publish failed");
            }
        }
    })
}

/// Forward inference requests arriving on this node's subject into a
/// handler; replies go to the embedded reply subject.
pub fn spawn_inference_subscriber(
    bus: BusClient,
    worker_id: String,
    handler: impl Fn(Bytes) -> Result<Bytes> + Send + Sync + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subject = subjects::worker_inference(&worker_id);
        let mut subscription = match bus.subscribe(&subject).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Inference subscribe failed");
                return;
            }
        };
        info!(subject = %subject, "Inference subscriber started");

        while let Some(message) = subscription.next().await {
            let response = handler(message.payload.clone());
            if let Some(reply) = message.reply {
                let body = match response {
                    Ok(bytes) => bytes,
                    Err(e) => Bytes::from(format!("{{\"error\":\"{e}\"}}")),
                };
                if let Err(e) = bus.publish(reply.as_str(), body).await {
                    warn!(error = %e, "Inference reply failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_shapes() {
        assert_eq!(
            subjects::worker_inference("w-1"),
            "worker.w-1.inference"
        );
        assert_eq!(subjects::response("req-9"), "response.req-9");
        assert_eq!(subjects::WORKER_HEARTBEAT, "worker.heartbeat");
    }

    #[test]
    fn test_heartbeat_serializes() {
        let heartbeat = NodeHeartbeat {
            node_id: "node-1".to_string(),
            active_workers: 2,
            active_streams: 5,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(json["node_id"], "node-1");
        assert_eq!(json["active_workers"], 2);
    }

    // Connection-level tests require a running NATS server; the
    // docker-compose dev stack provides one.
}
