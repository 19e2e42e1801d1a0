//! Typed configuration from an optional TOML file and environment variables.
//!
//! Loads once at startup. Environment variables override the file, the file
//! overrides built-in defaults. Malformed values fail fast.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::DEFAULT_LOG_PATH;

pub const ENV_LOG_PATH: &str = "TASK_LOGGER_LOG";
pub const ENV_SUPPRESS_ERRORS: &str = "TASK_LOGGER_SUPPRESS_ERRORS";
pub const ENV_CHECKPOINT_ON_ENTRY: &str = "TASK_LOGGER_CHECKPOINT_ON_ENTRY";
pub const ENV_OTEL_ENDPOINT: &str = "OTEL_ENDPOINT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Log file the session reads and writes.
    pub log_path: PathBuf,
    /// Record-and-continue on ordinary step failures (`false` re-raises them).
    pub suppress_errors: bool,
    /// Flush the log as soon as a record is marked `attempting`.
    pub checkpoint_on_entry: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            suppress_errors: true,
            checkpoint_on_entry: true,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    log_path: Option<PathBuf>,
    suppress_errors: Option<bool>,
    checkpoint_on_entry: Option<bool>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables over the defaults.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document over the defaults. Environment is not consulted.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(text)?;
        let mut config = Self::default();
        if let Some(v) = file.log_path {
            config.log_path = v;
        }
        if let Some(v) = file.suppress_errors {
            config.suppress_errors = v;
        }
        if let Some(v) = file.checkpoint_on_entry {
            config.checkpoint_on_entry = v;
        }
        if file.otel_endpoint.is_some() {
            config.otel_endpoint = file.otel_endpoint;
        }
        if let Some(v) = file.log_level {
            config.log_level = v;
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var(ENV_LOG_PATH) {
            self.log_path = PathBuf::from(v);
        }
        if let Some(v) = env_var(ENV_SUPPRESS_ERRORS) {
            self.suppress_errors = parse_bool(ENV_SUPPRESS_ERRORS, &v)?;
        }
        if let Some(v) = env_var(ENV_CHECKPOINT_ON_ENTRY) {
            self.checkpoint_on_entry = parse_bool(ENV_CHECKPOINT_ON_ENTRY, &v)?;
        }
        if let Some(v) = env_var(ENV_OTEL_ENDPOINT) {
            self.otel_endpoint = Some(v);
        }
        if let Some(v) = env_var(ENV_LOG_LEVEL) {
            self.log_level = v;
        }
        Ok(())
    }
}

/// Set and non-empty.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "environment variable {name} must be a boolean, got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "Yes").unwrap());
        assert!(parse_bool("X", " 1 ").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(matches!(parse_bool("X", "maybe"), Err(Error::Config(_))));
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            log_path = "runs/import-log.json"
            suppress_errors = false
            "#,
        )
        .unwrap();
        assert_eq!(config.log_path, PathBuf::from("runs/import-log.json"));
        assert!(!config.suppress_errors);
        assert!(config.checkpoint_on_entry);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = Config::from_toml("log_file = \"x.json\"").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }
}
