//! Logging infrastructure
//!
//! Tracing initialisation plus a JSONL usage logger for generation
//! events, consumable by external analytics.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::types::Result;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the given level applies to the
/// crate and `info` to everything else.
pub fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gantry={level},info").into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// One generation's usage record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationUsage {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub stream_id: String,
    pub model_id: String,
    pub tokens_generated: u64,
    pub time_to_first_token_ms: f64,
    pub total_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Append-only JSONL usage log
pub struct UsageLogger {
    path: PathBuf,
    writer: Mutex<()>,
}

impl UsageLogger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(()),
        }
    }

    /// Append one event. Logging failures are reported, never fatal.
    pub async fn log(&self, usage: &GenerationUsage) {
        if let Err(e) = self.append(usage).await {
            error!(error = %e, "Usage log write failed");
        }
    }

    async fn append(&self, usage: &GenerationUsage) -> Result<()> {
        let mut line = serde_json::to_vec(usage)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_usage_log_appends_jsonl() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("usage.jsonl");
        let logger = UsageLogger::new(path.clone());

        for i in 0..2 {
            logger
                .log(&GenerationUsage {
                    timestamp: Utc::now(),
                    node_id: "n1".to_string(),
                    stream_id: format!("s{i}"),
                    model_id: "m1".to_string(),
                    tokens_generated: 10 + i,
                    time_to_first_token_ms: 12.0,
                    total_time_ms: 100.0,
                    tenant_id: None,
                })
                .await;
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: GenerationUsage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.stream_id, "s0");
        assert_eq!(first.tokens_generated, 10);
    }
}
