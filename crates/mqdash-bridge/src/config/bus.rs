//! Secondary pub/sub bus (Redis) configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default Redis port.
pub const DEFAULT_BUS_PORT: u16 = 6379;

/// Default socket read/write timeout in seconds.
pub const DEFAULT_IO_TIMEOUT: u64 = 5;

/// Redis connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Password sent with AUTH, if any.
    pub password: Option<String>,
    /// TCP connect timeout in seconds.
    pub connect_timeout: u64,
    /// Read and write timeout on request connections, in seconds
    /// (0 = wait forever).
    pub io_timeout: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BUS_PORT,
            password: None,
            connect_timeout: 5,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl BusConfig {
    /// Redis address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Socket timeout for request connections; `None` when disabled.
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout > 0).then(|| Duration::from_secs(self.io_timeout))
    }

    /// Validate bus configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("bus.port must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout() {
        let mut config = BusConfig::default();
        assert_eq!(config.io_timeout(), Some(Duration::from_secs(DEFAULT_IO_TIMEOUT)));
        config.io_timeout = 0;
        assert_eq!(config.io_timeout(), None);
    }
}
