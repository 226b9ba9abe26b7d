use std::fs;
use std::path::Path;

use miette::Diagnostic;
use serde::Deserialize;
use tether_gc::RootsConfig;
use thiserror::Error;

/// Settings for one [`Loop`](crate::Loop), usually read from a TOML file:
///
/// ```toml
/// [roots]
/// initial_capacity = 64
/// max_entries = 65536
///
/// [dispatch]
/// log_events = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    pub roots: RootsConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Debug-log every event handed to a host callback.
    pub log_events: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    #[diagnostic(code("TETHER-CFG-001"))]
    Read { path: String, message: String },

    #[error("Invalid config syntax: {0}")]
    #[diagnostic(code("TETHER-CFG-002"))]
    Parse(String),

    #[error("Invalid config value: {0}")]
    #[diagnostic(
        code("TETHER-CFG-003"),
        help("A started handle pins two values, so `roots.max_entries` must be at least 2.")
    )]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.message().to_string())
    }
}

impl LoopConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: LoopConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        log::debug!("Loaded loop config from {}.", path.display());
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.roots.max_entries {
            if limit < 2 {
                return Err(ConfigError::Invalid(format!(
                    "roots.max_entries = {} leaves no room for a started handle",
                    limit
                )));
            }
        }
        Ok(())
    }
}
