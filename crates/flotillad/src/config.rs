//! flotilla.toml configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlotillaConfig {
    pub store: Option<StoreConfig>,
    pub ports: Option<PortsConfig>,
    pub timeouts: Option<TimeoutsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    pub local_port_min: Option<u32>,
    pub local_port_max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub task_launch_seconds: Option<u64>,
    pub reconciliation_interval_seconds: Option<u64>,
    pub kill_wait_seconds: Option<u64>,
}

/// Fully resolved settings after merging file and CLI values.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_path: PathBuf,
    pub local_port_min: u32,
    pub local_port_max: u32,
    pub task_launch_timeout: Duration,
    pub reconciliation_interval: Duration,
    pub kill_wait_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/flotilla/state.redb"),
            local_port_min: 10_000,
            local_port_max: 20_000,
            task_launch_timeout: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(600),
            kill_wait_timeout: Duration::from_secs(120),
        }
    }
}

impl FlotillaConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlotillaConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay file values onto the defaults.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(store) = &self.store {
            if let Some(path) = &store.path {
                settings.store_path = path.clone();
            }
        }
        if let Some(ports) = &self.ports {
            if let Some(min) = ports.local_port_min {
                settings.local_port_min = min;
            }
            if let Some(max) = ports.local_port_max {
                settings.local_port_max = max;
            }
        }
        if let Some(timeouts) = &self.timeouts {
            if let Some(secs) = timeouts.task_launch_seconds {
                settings.task_launch_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = timeouts.reconciliation_interval_seconds {
                settings.reconciliation_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = timeouts.kill_wait_seconds {
                settings.kill_wait_timeout = Duration::from_secs(secs);
            }
        }
        settings
    }
}
