//! Sampler configuration
//!
//! TOML-backed settings for the counter watcher; command-line flags
//! override individual fields.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay between sampling iterations, in microseconds.
    #[serde(default = "default_interval_us")]
    pub interval_us: u64,

    /// Also read the counter-clearing slot 15 of every module each
    /// iteration. Off by default; the exact clearing semantics are a
    /// hardware property this tool does not model.
    #[serde(default)]
    pub reset_after_read: bool,
}

fn default_interval_us() -> u64 {
    1_000_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_us: default_interval_us(),
            reset_after_read: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
