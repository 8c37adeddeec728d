//! Logging configuration.

use std::collections::BTreeMap;

use serde::Deserialize;

/// `[log]` section.
///
/// ```toml
/// [log]
/// level = "info"
///
/// [log.modules]
/// "mqdash_bridge::redis" = "debug"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level: error, warn, info, debug, trace.
    pub level: String,
    /// Per-module level overrides.
    pub modules: BTreeMap<String, String>,
}

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Filter string for `env_logger`, e.g. `info,mqdash_bridge::redis=debug`.
    pub fn filter(&self) -> String {
        let mut filter = self.level.clone();
        for (module, level) in &self.modules {
            filter.push(',');
            filter.push_str(module);
            filter.push('=');
            filter.push_str(level);
        }
        filter
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let check = |level: &str| {
            if LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                Ok(())
            } else {
                Err(format!("log level '{}' is not one of {:?}", level, LEVELS))
            }
        };
        check(&self.level)?;
        for (module, level) in &self.modules {
            if module.is_empty() {
                return Err("log module name must not be empty".to_string());
            }
            check(level)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_with_overrides() {
        let mut config = LogConfig::default();
        assert_eq!(config.filter(), "info");

        config.level = "warn".to_string();
        config
            .modules
            .insert("mqdash_bridge::redis".to_string(), "debug".to_string());
        config
            .modules
            .insert("mqdash_client".to_string(), "trace".to_string());
        assert_eq!(
            config.filter(),
            "warn,mqdash_bridge::redis=debug,mqdash_client=trace"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_level() {
        let config = LogConfig {
            level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = LogConfig::default();
        config.modules.insert("x".to_string(), "loud".to_string());
        assert!(config.validate().is_err());
    }
}
