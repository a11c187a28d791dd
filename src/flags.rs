//! Feature flags with deterministic percentage rollout
//!
//! A request is in a flag's rollout when
//! `MD5(request_id + seed) mod 100 < rollout_percentage`, so the same
//! request id always lands on the same side of a flag. A global kill
//! switch disables all feature routing at once.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use md5::{Digest, Md5};
use tracing::info;

/// One flag's rollout state
#[derive(Debug, Clone)]
pub struct FlagConfig {
    pub enabled: bool,
    /// 0–100; 100 means everyone
    pub rollout_percentage: u8,
    /// Salt for the rollout hash, so flags bucket independently
    pub seed: String,
}

pub struct FeatureFlags {
    flags: DashMap<String, FlagConfig>,
    kill_switch: AtomicBool,
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
            kill_switch: AtomicBool::new(false),
        }
    }

    pub fn set(&self, name: &str, config: FlagConfig) {
        self.flags.insert(name.to_string(), config);
    }

    pub fn remove(&self, name: &str) {
        self.flags.remove(name);
    }

    /// Disable all feature routing immediately.
    pub fn kill(&self) {
        info!("Feature flag kill switch engaged");
        self.kill_switch.store(true, Ordering::Release);
    }

    pub fn revive(&self) {
        self.kill_switch.store(false, Ordering::Release);
    }

    /// Whether `request_id` is inside the flag's rollout.
    pub fn is_enabled(&self, name: &str, request_id: &str) -> bool {
        if self.kill_switch.load(Ordering::Acquire) {
            return false;
        }
        let Some(flag) = self.flags.get(name) else {
            return false;
        };
        if !flag.enabled {
            return false;
        }
        if flag.rollout_percentage >= 100 {
            return true;
        }
        rollout_bucket(request_id, &flag.seed) < flag.rollout_percentage
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic bucket in 0..100 from MD5(request_id + seed)
fn rollout_bucket(request_id: &str, seed: &str) -> u8 {
    let mut hasher = Md5::new();
    hasher.update(request_id.as_bytes());
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    // First 8 bytes as a big-endian integer, mod 100
    let mut value = 0u64;
    for byte in &digest[..8] {
        value = (value << 8) | *byte as u64;
    }
    (value % 100) as u8
}
