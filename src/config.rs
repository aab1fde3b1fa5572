// Configuration loading for the msgtable CLI

use crate::table::DEFAULT_NAMESPACE;
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix for the table's substrate keys
    pub namespace: String,

    /// JSONL snapshot backing the store
    pub snapshot_path: PathBuf,

    /// Seconds between background snapshots in `shell` mode
    pub snapshot_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            snapshot_path: default_data_dir().join("snapshot.jsonl"),
            snapshot_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and defaults are used if nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).wrap_err_with(|| format!("Invalid config file {}", path.display()))?;

        debug!(path = ?path, ?config, "Loaded config");
        Ok(config)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.snapshot_interval_secs == 0 {
            return Err(eyre!("snapshot_interval_secs must be greater than zero"));
        }
        if self.snapshot_path.as_os_str().is_empty() {
            return Err(eyre!("snapshot_path cannot be empty"));
        }
        Ok(())
    }
}

/// `<config dir>/msgtable/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("msgtable").join("config.yaml"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("msgtable")
}
