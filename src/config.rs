//! Layered daemon configuration.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. `academyd.toml` in the working directory, or the file named by
//!    `ACADEMYD_CONFIG`
//! 3. `ACADEMYD_*` environment variables (`__` separates sections, so
//!    `ACADEMYD_LOG__LEVEL` maps to `log.level`)

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "academyd.toml";
const CONFIG_PATH_ENV: &str = "ACADEMYD_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(#[from] figment::Error),

    /// The privileged client path cannot start without a service-role key.
    #[error("service key is not configured (set ACADEMYD_SERVICE_KEY)")]
    MissingServiceKey,

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Rotated log files go here; stderr when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AcademydConfig {
    /// Workspace opened at startup, before any `workspace.select`.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default)]
    pub log: LogConfig,
}

impl AcademydConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let file = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }

        figment.merge(Env::prefixed("ACADEMYD_").split("__"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "log.level".to_string(),
                    reason: format!("unsupported level `{other}`"),
                })
            }
        }
        if let Some(key) = &self.service_key {
            if key.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "service_key".to_string(),
                    reason: "must not be blank".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The configured service-role key, or the fatal error for the privileged path.
    pub fn require_service_key(&self) -> Result<&str, ConfigError> {
        self.service_key
            .as_deref()
            .ok_or(ConfigError::MissingServiceKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = AcademydConfig::load().expect("defaults load");
            assert_eq!(config.log.level, "info");
            assert!(config.log.dir.is_none());
            assert!(config.workspace.is_none());
            assert!(matches!(
                config.require_service_key(),
                Err(ConfigError::MissingServiceKey)
            ));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_toml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "academyd.toml",
                r#"
                    service_key = "from-file"
                    [log]
                    level = "debug"
                "#,
            )?;
            jail.set_env("ACADEMYD_SERVICE_KEY", "from-env");

            let config = AcademydConfig::load().expect("config loads");
            assert_eq!(config.require_service_key().ok(), Some("from-env"));
            assert_eq!(config.log.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn nested_env_keys_use_double_underscore() {
        Jail::expect_with(|jail| {
            jail.set_env("ACADEMYD_LOG__LEVEL", "warn");
            jail.set_env("ACADEMYD_WORKSPACE", "/tmp/academy-ws");
            let config = AcademydConfig::load().expect("config loads");
            assert_eq!(config.log.level, "warn");
            assert_eq!(config.workspace, Some(PathBuf::from("/tmp/academy-ws")));
            Ok(())
        });
    }

    #[test]
    fn rejects_unknown_log_level() {
        Jail::expect_with(|jail| {
            jail.set_env("ACADEMYD_LOG__LEVEL", "loud");
            let result = AcademydConfig::load();
            assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
            Ok(())
        });
    }
}
