//! Configuration models for the castor coordinator and worker daemon.
//!
//! Both binaries read a TOML file (path from the CLI) and apply environment
//! overrides on top. Durations are written humantime-style (`"5s"`,
//! `"2m 30s"`). Every knob has the documented default, so an empty file is a
//! valid configuration.

mod coordinator;
mod daemon;
pub(crate) mod duration;

use std::path::Path;

pub use coordinator::{CoordinatorConfig, SessionConfig};
pub use daemon::DaemonConfig;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub(crate) fn load_toml<T: DeserializeOwned + Default>(
    path: Option<&Path>,
) -> Result<T, ConfigError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&raw)?)
        }
        None => Ok(T::default()),
    }
}
