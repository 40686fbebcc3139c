//! Global configuration model for the Veil daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, VeilError};

/// When the passive log monitor runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMonitorMode {
    /// Only when the syscall-level monitor is disabled or failed to start.
    #[default]
    Fallback,
    /// Alongside the syscall-level monitor.
    Always,
    /// Never.
    Never,
}

/// Root configuration for the Veil daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Denylist database path.
    pub db_path: PathBuf,
    /// Per-user application data root.
    pub app_data_dir: PathBuf,
    /// Directory holding the package registry.
    pub system_data_dir: PathBuf,
    /// Base path of the supervisor executable (`32`/`64` suffixes are probed).
    pub app_process: PathBuf,
    /// Procfs mount point.
    pub proc_root: PathBuf,
    /// Inject mounts into targets instead of reverting them.
    pub allowlist_mode: bool,
    /// Whether the syscall-level zygote monitor is started on enforce.
    pub zygote_monitor: bool,
    /// When the passive log monitor runs.
    pub log_monitor: LogMonitorMode,
    /// Executable invoked as `<helper> revert|mount <pid>`.
    pub remediation_helper: PathBuf,
    /// Supervisor discovery interval in milliseconds.
    pub discovery_interval_ms: u64,
    /// Namespace-separation poll interval in milliseconds.
    pub separation_poll_ms: u64,
    /// Maximum namespace-separation poll attempts.
    pub separation_max_attempts: u32,
    /// Kill pre-forked supervisor pools when enforcement starts.
    pub kill_usap_pools: bool,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(constants::DEFAULT_SOCKET_PATH),
            db_path: PathBuf::from(constants::DEFAULT_DB_PATH),
            app_data_dir: PathBuf::from(constants::APP_DATA_DIR),
            system_data_dir: PathBuf::from(constants::SYSTEM_DATA_DIR),
            app_process: PathBuf::from(constants::APP_PROCESS),
            proc_root: PathBuf::from(constants::PROC_ROOT),
            allowlist_mode: false,
            zygote_monitor: true,
            log_monitor: LogMonitorMode::Fallback,
            remediation_helper: PathBuf::from("/data/adb/veil/veil-helper"),
            discovery_interval_ms: 250,
            separation_poll_ms: 10,
            separation_max_attempts: 300,
            kill_usap_pools: true,
        }
    }
}

impl VeilConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the defaults; absent fields take their default.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VeilError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Config`] on an out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.discovery_interval_ms == 0 {
            return Err(VeilError::Config {
                message: "discovery_interval_ms must be greater than zero".into(),
            });
        }
        if self.separation_poll_ms == 0 || self.separation_max_attempts == 0 {
            return Err(VeilError::Config {
                message: "separation polling needs a non-zero interval and attempt count".into(),
            });
        }
        Ok(())
    }

    /// Returns the supervisor discovery interval.
    #[must_use]
    pub const fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    /// Returns the namespace-separation poll interval.
    #[must_use]
    pub const fn separation_poll(&self) -> Duration {
        Duration::from_millis(self.separation_poll_ms)
    }
}
