//! Service configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `mqdash.toml`)
//! - Environment variables with `MQDASH__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQDASH__BROKER__HOST=mosquitto`
//! - `MQDASH__BROKER__TLS__ENABLED=true`
//! - `MQDASH__BRIDGE__STATS_INTERVAL=10`
//!
//! In-file substitution examples:
//! ```toml
//! [broker]
//! host = "${MQTT_BROKER_HOST:-mosquitto}"
//! password = "${MQTT_PASSWORD}"
//! ```

mod bridge;
mod broker;
mod bus;
mod log;
mod tracker;

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{BridgeConfig, DEFAULT_STATS_INTERVAL};
pub use broker::{
    BrokerConfig, BrokerTlsConfig, DEFAULT_BROKER_PORT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_KEEPALIVE, DEFAULT_RECONNECT_DELAY,
};
pub use bus::{BusConfig, DEFAULT_BUS_PORT, DEFAULT_IO_TIMEOUT};
pub use self::log::LogConfig;
pub use tracker::{
    TrackerConfig, DEFAULT_INACTIVE_TIMEOUT, DEFAULT_MAX_PAYLOAD_SIZE, MAX_INACTIVE_TIMEOUT,
};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Broker connection configuration.
    pub broker: BrokerConfig,
    /// Topic activity tracker configuration.
    pub tracker: TrackerConfig,
    /// Bridge process configuration.
    pub bridge: BridgeConfig,
    /// Secondary bus configuration.
    pub bus: BusConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", DEFAULT_BROKER_PORT as i64)?
            .set_default("broker.client_id", "mqtt-dashboard")?
            .set_default("broker.keepalive", DEFAULT_KEEPALIVE as i64)?
            .set_default("broker.reconnect_delay", DEFAULT_RECONNECT_DELAY as i64)?
            .set_default("broker.connect_timeout", DEFAULT_CONNECT_TIMEOUT as i64)?
            .set_default("broker.auto_reconnect", true)?
            .set_default("broker.tls.enabled", false)?
            .set_default("broker.tls.accept_invalid_certs", false)?
            .set_default("tracker.inactive_timeout", DEFAULT_INACTIVE_TIMEOUT as i64)?
            .set_default("tracker.max_payload_size", DEFAULT_MAX_PAYLOAD_SIZE as i64)?
            .set_default("tracker.track_sys_topics", false)?
            .set_default("bridge.stats_interval", DEFAULT_STATS_INTERVAL as i64)?
            .set_default("bridge.client_id", "mqtt-bridge-service")?
            .set_default("bus.host", "localhost")?
            .set_default("bus.port", DEFAULT_BUS_PORT as i64)?
            .set_default("bus.connect_timeout", 5)?
            .set_default("bus.io_timeout", DEFAULT_IO_TIMEOUT as i64)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQDASH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (for testing).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate().map_err(ConfigError::Validation)?;
        self.broker.validate().map_err(ConfigError::Validation)?;
        self.tracker.validate().map_err(ConfigError::Validation)?;
        self.bridge.validate().map_err(ConfigError::Validation)?;
        self.bus.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[broker]
host = "mosquitto"
port = 8883
username = "dash"
password = "secret"
reconnect_delay = 2

[broker.tls]
enabled = true
accept_invalid_certs = true

[tracker]
inactive_timeout = 600
max_payload_size = 256
track_sys_topics = true

[bridge]
stats_interval = 10

[bus]
host = "redis"
password = "hunter2"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.broker.address(), "mosquitto:8883");
        assert_eq!(config.broker.username.as_deref(), Some("dash"));
        assert_eq!(config.broker.password.as_deref(), Some("secret"));
        assert_eq!(config.broker.reconnect_delay, 2);
        assert!(config.broker.tls.enabled);
        assert!(config.broker.tls.accept_invalid_certs);
        assert_eq!(config.tracker.inactive_timeout, 600);
        assert_eq!(config.tracker.max_payload_size, 256);
        assert!(config.tracker.track_sys_topics);
        assert_eq!(config.bridge.stats_interval, 10);
        assert_eq!(config.bus.address(), "redis:6379");
        assert_eq!(config.bus.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[broker]
port = 1884
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.keepalive, DEFAULT_KEEPALIVE);
        assert_eq!(config.tracker.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(config.bridge.stats_interval, DEFAULT_STATS_INTERVAL);
        assert_eq!(config.bridge.client_id, "mqtt-bridge-service");
    }

    #[test]
    fn test_parse_rejects_zero_interval() {
        let toml = r#"
[bridge]
stats_interval = 0
"#;
        assert!(matches!(
            Config::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_rejects_zero_payload_size() {
        let toml = r#"
[tracker]
max_payload_size = 0
"#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_parse_rejects_huge_inactive_timeout() {
        let toml = r#"
[tracker]
inactive_timeout = 10000000000000000
"#;
        assert!(matches!(
            Config::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MQDASH_TEST_BROKER_HOST", "broker.internal");
        let content = r#"
[broker]
host = "${MQDASH_TEST_BROKER_HOST}"
"#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("broker.internal"));
        std::env::remove_var("MQDASH_TEST_BROKER_HOST");
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQDASH_NONEXISTENT_VAR");
        let content = r#"host = "${MQDASH_NONEXISTENT_VAR:-mosquitto}""#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("mosquitto"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(PathBuf::from("/nonexistent/mqdash.toml")).unwrap();
        assert_eq!(config.broker.port, DEFAULT_BROKER_PORT);
        assert_eq!(config.tracker.inactive_timeout, DEFAULT_INACTIVE_TIMEOUT);
        assert_eq!(config.bus.io_timeout, DEFAULT_IO_TIMEOUT);
    }
}
