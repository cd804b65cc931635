//! Host configuration
//!
//! Loaded from an optional `nbkernel.toml` discovered along a fixed search
//! path, then overlaid with environment variables. Every field has a
//! default so a missing file is not an error.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Configuration file discovery order
const CONFIG_SEARCH_PATHS: &[&str] = &[
    "nbkernel.toml",
    ".nbkernel.toml",
    "config/nbkernel.toml",
];

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Budget for a kernel process to become ready, in seconds
    pub launch_timeout_secs: u64,
    /// Budget for an interrupt to be acknowledged, in seconds
    pub interrupt_timeout_secs: u64,
    /// Spawn a spare restart session in the background after connect
    pub prewarm_restart_sessions: bool,
    /// Running under CI; suppresses one-shot maintenance like spec archival
    pub ci_mode: bool,
    /// Promote per-kernel stdout/stderr lines to info-level tracing
    pub log_kernel_output: bool,
    /// Location of the persistent key-value store, when file-backed
    pub store_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: 60,
            interrupt_timeout_secs: 30,
            prewarm_restart_sessions: true,
            ci_mode: false,
            log_kernel_output: false,
            store_path: None,
        }
    }
}

impl HostConfig {
    /// Load configuration: discovered file (if any) overlaid with
    /// environment variables
    ///
    /// # Errors
    ///
    /// Returns an error when a discovered file exists but cannot be read
    /// or parsed. A missing file falls back to defaults.
    pub async fn load() -> anyhow::Result<Self> {
        let mut config = match Self::discover_config_file().await {
            Some(path) => Self::from_file(&path).await?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific TOML file
    ///
    /// # Errors
    ///
    /// Returns an error on read or parse failure.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)?;
        debug!("Loaded host configuration from {}", path.display());
        Ok(config)
    }

    async fn discover_config_file() -> Option<PathBuf> {
        for candidate in CONFIG_SEARCH_PATHS {
            let path = PathBuf::from(candidate);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    /// Overlay environment variables onto the loaded configuration
    pub fn apply_env_overrides(&mut self) {
        if env::var_os("CI").is_some() {
            self.ci_mode = true;
        }
        if let Ok(value) = env::var("LOG_KERNEL_OUTPUT") {
            self.log_kernel_output = is_truthy(&value);
        }
        if let Ok(value) = env::var("NBKERNEL_LAUNCH_TIMEOUT_SECS") {
            if let Ok(secs) = value.parse() {
                self.launch_timeout_secs = secs;
            }
        }
        if let Ok(value) = env::var("NBKERNEL_STORE_PATH") {
            self.store_path = Some(PathBuf::from(value));
        }
    }

    /// Launch budget as a `Duration`
    pub const fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    /// Interrupt budget as a `Duration`
    pub const fn interrupt_timeout(&self) -> Duration {
        Duration::from_secs(self.interrupt_timeout_secs)
    }
}

/// Boolean-ish environment values: 1/true/yes/on
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
