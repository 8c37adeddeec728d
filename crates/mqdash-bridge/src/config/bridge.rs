//! Bridge process configuration.

use serde::Deserialize;

/// Default stats publish interval in seconds.
pub const DEFAULT_STATS_INTERVAL: u64 = 5;

/// Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds between stats snapshots published to the bus.
    pub stats_interval: u64,
    /// Client identifier for the bridge's broker connection.
    pub client_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stats_interval: DEFAULT_STATS_INTERVAL,
            client_id: "mqtt-bridge-service".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Validate bridge configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.stats_interval == 0 {
            return Err("bridge.stats_interval must be greater than 0".to_string());
        }
        if self.client_id.is_empty() {
            return Err("bridge.client_id must not be empty".to_string());
        }
        Ok(())
    }
}
