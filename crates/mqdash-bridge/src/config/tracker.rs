//! Topic activity tracker configuration.

use serde::Deserialize;

/// Default inactivity window in seconds.
pub const DEFAULT_INACTIVE_TIMEOUT: u64 = 3600;
/// Upper bound for the inactivity window: ten years.
pub const MAX_INACTIVE_TIMEOUT: u64 = 10 * 365 * 86_400;
/// Default cap on the stored payload, in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024;

/// Topic activity tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Seconds without traffic before a topic is pruned (0 = never).
    pub inactive_timeout: u64,
    /// Maximum stored payload size in bytes.
    pub max_payload_size: usize,
    /// Also track `$SYS/` topics.
    pub track_sys_topics: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            inactive_timeout: DEFAULT_INACTIVE_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            track_sys_topics: false,
        }
    }
}

impl TrackerConfig {
    /// Validate tracker configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_payload_size == 0 {
            return Err("tracker.max_payload_size must be greater than 0".to_string());
        }
        if self.inactive_timeout > MAX_INACTIVE_TIMEOUT {
            return Err(format!(
                "tracker.inactive_timeout must be at most {} seconds (0 disables pruning)",
                MAX_INACTIVE_TIMEOUT
            ));
        }
        Ok(())
    }
}
