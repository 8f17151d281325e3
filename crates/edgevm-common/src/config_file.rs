//! Configuration file structures for edgevm.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: Static module name to locator mapping

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// pooling_allocator = false
/// fuel_yield_interval = 10_000
///
/// [runtime.execution]
/// memory_limit_pages = 256
/// output = "pipe"
///
/// [[modules]]
/// name = "library/math"
/// uri = "file:///srv/modules/math.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Module names with a fixed locator.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// A module name resolved to a fixed locator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Name guest code imports the module under.
    pub name: String,

    /// Where the module bytes live (`file://`, `https://`, `mem://`).
    pub uri: Url,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}
