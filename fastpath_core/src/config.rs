//! Configuration file support for FastPath.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/fastpath/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the store document inside the data directory
pub const STORE_FILE_NAME: &str = "fastpath.json";

/// Name of the live status file inside the data directory
pub const LIVE_STATUS_FILE_NAME: &str = "live_status.json";

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub timer: TimerConfig,

    #[serde(default)]
    pub goals: GoalsConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Live surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Whether the live surface starts enabled
    #[serde(default = "default_live_enabled")]
    pub enabled: bool,

    /// Override for the status file location; defaults to the data dir
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_live_enabled(),
            status_file: None,
        }
    }
}

/// Ticker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Extra goal definition seeded alongside the predefined goals
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtraGoal {
    pub name: String,
    pub hours: u64,
    pub description: Option<String>,
}

/// Goal catalog configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GoalsConfig {
    #[serde(default)]
    pub extra: Vec<ExtraGoal>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|_| PathBuf::from("."))
    });
    base.join("fastpath")
}

fn default_live_enabled() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from("."))
        });
        base.join("fastpath").join("config.toml")
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.timer.tick_interval_ms == 0 {
            return Err(Error::Config(
                "timer.tick_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Location of the record store document for a data directory
    pub fn store_path(data_dir: &Path) -> PathBuf {
        data_dir.join(STORE_FILE_NAME)
    }

    /// Location of the live status file, honouring `[live] status_file`
    pub fn live_status_path(&self, data_dir: &Path) -> PathBuf {
        self.live
            .status_file
            .clone()
            .unwrap_or_else(|| data_dir.join(LIVE_STATUS_FILE_NAME))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timer.tick_interval_ms)
    }
}
