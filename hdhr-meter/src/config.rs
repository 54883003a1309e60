//! Configuration loading for the tuner controller and the signal meter.
//!
//! Resolution order: explicit path > `hdhr-meter.toml` in the working
//! directory > built-in defaults.

use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

/// Tuning knobs of the device worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Interval between tuner-status poll cycles (milliseconds).
    pub poll_interval_ms: u64,
    /// Pause after every device command before the next task runs
    /// (milliseconds). The hardware reportedly needs the breather; keep
    /// it configurable rather than baked in.
    pub settle_delay_ms: u64,
    /// How long a scan probe waits for modulation lock after tuning
    /// (milliseconds).
    pub scan_lock_wait_ms: u64,
    /// Threads backing the timer/dispatch runtime.
    pub runtime_worker_threads: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            settle_delay_ms: 50,
            scan_lock_wait_ms: 250,
            runtime_worker_threads: 2,
        }
    }
}

/// Configuration file format.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceSection {
    pub id: Option<String>,
    pub addr: Option<String>,
    pub tuner: Option<u32>,
    /// `atsc` or `cablecard`.
    pub device_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Load a configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Resolve configuration: explicit path > auto-detect > defaults.
pub fn resolve_config(explicit: Option<PathBuf>) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let path = explicit.or_else(|| {
        let default_path = PathBuf::from("hdhr-meter.toml");
        default_path.exists().then_some(default_path)
    });

    match path {
        Some(path) => {
            debug!("loading configuration from {}", path.display());
            load_config(&path)
        }
        None => Ok(ConfigFile::default()),
    }
}
