//! MQTT broker connection configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Default MQTT port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;
/// Default keep-alive in seconds.
pub const DEFAULT_KEEPALIVE: u16 = 60;
/// Default delay between reconnect attempts in seconds.
pub const DEFAULT_RECONNECT_DELAY: u64 = 5;
/// Default time allowed for a connection to be accepted, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier used by dashboard processes.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keepalive: u16,
    /// Delay between reconnect attempts in seconds.
    pub reconnect_delay: u64,
    /// Seconds to wait for the broker to accept a connection.
    pub connect_timeout: u64,
    /// Reconnect automatically when the broker drops the connection.
    pub auto_reconnect: bool,
    /// Transport encryption.
    pub tls: BrokerTlsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            client_id: "mqtt-dashboard".to_string(),
            username: None,
            password: None,
            keepalive: DEFAULT_KEEPALIVE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: true,
            tls: BrokerTlsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Broker address as `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate broker configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("broker.host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("broker.port must be non-zero".to_string());
        }
        if self.client_id.is_empty() {
            return Err("broker.client_id must not be empty".to_string());
        }
        if self.connect_timeout == 0 {
            return Err("broker.connect_timeout must be at least 1 second".to_string());
        }
        self.tls.validate()
    }
}

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerTlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// PEM file with CA certificates (public roots when unset).
    pub ca_cert: Option<PathBuf>,
    /// Server name to verify against (defaults to the host).
    pub server_name: Option<String>,
    /// Accept any server certificate (insecure).
    pub accept_invalid_certs: bool,
}

impl BrokerTlsConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref path) = self.ca_cert {
            if !path.exists() {
                return Err(format!("broker.tls.ca_cert not found: {}", path.display()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.address(), "localhost:1883");
        assert_eq!(config.keepalive, 60);
        assert_eq!(config.reconnect_delay, 5);
        assert!(config.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = BrokerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_missing_ca_cert() {
        let config = BrokerConfig {
            tls: BrokerTlsConfig {
                enabled: true,
                ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
