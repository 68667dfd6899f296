//! Operator configuration, persisted as JSON under the corral config
//! directory.
//!
//! Loading never fails: a missing file is created with defaults, an
//! unreadable or unparseable file falls back to defaults with a warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::CorralError;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Application configuration.
///
/// Every field has a serde default so configs written by older releases
/// keep loading after new keys are added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Program launched in new instances when `--program` is absent.
    #[serde(default = "default_program")]
    pub default_program: String,
    /// Default auto-yes flag for new instances.
    #[serde(default)]
    pub auto_yes: bool,
    /// Supervisor tick period in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub daemon_poll_interval: u64,
    /// Prefix for instance branches, e.g. `alice/`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Default watchdog flag for new instances.
    #[serde(default = "default_watchdog_enabled")]
    pub watchdog_enabled: bool,
    /// Inactivity threshold before a non-continuous session counts as stalled.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_seconds: u64,
    /// Maximum continue injections between content changes.
    #[serde(default = "default_max_continue_attempts")]
    pub max_continue_attempts: u32,
    /// Override for the continue-candidate list; empty means built-in.
    #[serde(default)]
    pub continue_commands: Vec<String>,
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_branch_prefix() -> String {
    // Branch prefix derives from the local user name so instance branches
    // group under the operator in shared remotes.
    match std::env::var("USER").or_else(|_| std::env::var("LOGNAME")) {
        Ok(user) if !user.is_empty() => format!("{}/", user.to_lowercase()),
        _ => "corral/".to_string(),
    }
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_stall_timeout() -> u64 {
    300
}

fn default_max_continue_attempts() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_program: default_program(),
            auto_yes: false,
            daemon_poll_interval: default_poll_interval(),
            branch_prefix: default_branch_prefix(),
            watchdog_enabled: default_watchdog_enabled(),
            stall_timeout_seconds: default_stall_timeout(),
            max_continue_attempts: default_max_continue_attempts(),
            continue_commands: Vec::new(),
        }
    }
}

/// The corral configuration directory: `$HOME/.corral`.
pub fn config_dir() -> Result<PathBuf, CorralError> {
    let home = std::env::var("HOME")
        .map_err(|_| CorralError::Config("HOME environment variable not set".into()))?;
    Ok(PathBuf::from(home).join(".corral"))
}

impl Config {
    /// Load from `<dir>/config.json`, falling back to defaults.
    ///
    /// A missing file is created with default contents so the operator has
    /// something to edit.
    pub fn load(dir: &Path) -> Config {
        let path = dir.join(CONFIG_FILE_NAME);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                if let Err(save_err) = config.save(dir) {
                    warn!(error = %save_err, "failed to save default config");
                }
                return config;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read config file");
                return Config::default();
            }
        };

        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to parse config file");
                Config::default()
            }
        }
    }

    /// Write the configuration to `<dir>/config.json`.
    pub fn save(&self, dir: &Path) -> Result<(), CorralError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CorralError::Config(format!("failed to create config directory: {e}")))?;
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| CorralError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), data)
            .map_err(|e| CorralError::Config(format!("failed to write config file: {e}")))
    }
}
