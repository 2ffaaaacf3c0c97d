//! Daemon configuration
//!
//! Listen address, DHT client flavor, and metrics credentials. Loaded
//! from a JSON file with env var overrides; flags override both.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address (default: 127.0.0.1:3333)
    pub listen_addr: String,
    /// Use the widened-parallelism DHT client with aggressive bootstrap
    /// (default: false)
    pub accelerated_dht: bool,
    /// Basic-auth username protecting /metrics; unset leaves it open
    pub metrics_username: Option<String>,
    /// Basic-auth password protecting /metrics
    pub metrics_password: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3333".to_string(),
            accelerated_dht: false,
            metrics_username: None,
            metrics_password: None,
        }
    }
}

impl DaemonConfig {
    /// Load config from a file, falling back to defaults. Env vars always
    /// take priority.
    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<DaemonConfig>(&data) {
                Ok(c) => {
                    info!("Loaded daemon config from {:?}", path);
                    c
                }
                Err(e) => {
                    warn!("Failed to parse config {:?}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
        };

        config.apply_env_overrides();
        config
    }

    /// Defaults plus env var overrides, for runs without a config file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Credentials pair when both halves are configured.
    pub fn metrics_auth(&self) -> Option<(String, String)> {
        match (&self.metrics_username, &self.metrics_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CIDCHECK_LISTEN_ADDR") {
            debug!("CIDCHECK_LISTEN_ADDR={}", val);
            self.listen_addr = val;
        }
        if let Ok(val) = std::env::var("CIDCHECK_ACCELERATED_DHT") {
            if let Ok(enabled) = val.parse::<bool>() {
                debug!("CIDCHECK_ACCELERATED_DHT={}", enabled);
                self.accelerated_dht = enabled;
            }
        }
        if let Ok(val) = std::env::var("CIDCHECK_METRICS_USERNAME") {
            self.metrics_username = Some(val);
        }
        if let Ok(val) = std::env::var("CIDCHECK_METRICS_PASSWORD") {
            self.metrics_password = Some(val);
        }
    }
}
