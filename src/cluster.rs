//! Cluster configuration file
//!
//! Optional YAML describing the node's place in a cluster, with
//! `${VAR}` environment interpolation applied to the raw text before
//! parsing. Unknown keys are rejected at load time so a typo fails
//! fast instead of being silently ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{GantryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster name, used in bus client names
    pub name: String,
    /// This node's role: gateway, worker, hybrid
    #[serde(default = "default_role")]
    pub role: String,
    /// NATS endpoints for the cluster bus
    #[serde(default)]
    pub bus_urls: Vec<String>,
    /// Peer nodes by id
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Heartbeat publication interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_role() -> String {
    "hybrid".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub node_id: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl ClusterConfig {
    /// Load and interpolate a cluster config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let interpolated = interpolate_env(&raw)?;
        let config: ClusterConfig = serde_yaml::from_str(&interpolated)
            .map_err(|e| GantryError::Validation(format!("cluster config: {e}")))?;
        info!(
            cluster = %config.name,
            role = %config.role,
            peers = config.peers.len(),
            "Cluster config loaded"
        );
        Ok(config)
    }
}

/// Replace every `${VAR}` with the environment variable's value; a
/// missing variable is a validation error.
pub fn interpolate_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(GantryError::Validation(
                "unterminated ${ in cluster config".to_string(),
            ));
        };
        let name = &after[..end];
        if name.is_empty() {
            return Err(GantryError::Validation(
                "empty ${} in cluster config".to_string(),
            ));
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                return Err(GantryError::Validation(format!(
                    "environment variable '{name}' is not set"
                )));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_env() {
        std::env::set_var("GANTRY_TEST_REGION", "eu-1");
        let out = interpolate_env("region: ${GANTRY_TEST_REGION}").unwrap();
        assert_eq!(out, "region: eu-1");

        assert!(interpolate_env("x: ${GANTRY_TEST_DOES_NOT_EXIST}").is_err());
        assert!(interpolate_env("x: ${unclosed").is_err());
        assert!(interpolate_env("x: ${}").is_err());
    }

    #[tokio::test]
    async fn test_load_valid_config() {
        std::env::set_var("GANTRY_TEST_BUS", "nats://bus:4222");
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cluster.yaml");
        tokio::fs::write(
            &path,
            "name: prod\nrole: gateway\nbus_urls:\n  - ${GANTRY_TEST_BUS}\npeers:\n  - node_id: n2\n    region: us-1\n",
        )
        .await
        .unwrap();

        let config = ClusterConfig::load(&path).await.unwrap();
        assert_eq!(config.name, "prod");
        assert_eq!(config.bus_urls, vec!["nats://bus:4222"]);
        assert_eq!(config.peers[0].node_id, "n2");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[tokio::test]
    async fn test_unknown_keys_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cluster.yaml");
        tokio::fs::write(&path, "name: prod\nunknown_option: true\n")
            .await
            .unwrap();

        let result = ClusterConfig::load(&path).await;
        assert!(matches!(result, Err(GantryError::Validation(_))));
    }
}
