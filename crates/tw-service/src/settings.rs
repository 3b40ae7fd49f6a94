//! Daemon settings
//!
//! Loaded from a TOML file; every key is optional.
//!
//! ```toml
//! config_dir = "/etc/tunwarden"
//! runtime_dir = "/run/tunwarden"
//! backend = "system"
//! log_filter = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tw_ipc::SocketPaths;
use tw_net::ReadinessPolicy;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/tunwarden/tunwarden.toml";

/// Which implementations of the OS contracts to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Real host: iproute2, nftables, systemd
    #[default]
    System,
    /// In-process models, for dry runs
    Memory,
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of stored tunnel configs
    pub config_dir: PathBuf,
    /// Directory holding the control sockets
    pub runtime_dir: PathBuf,
    pub backend: Backend,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Pause between service-manager polls (ms)
    pub service_poll_interval_ms: u64,
    pub ipv4_ready_attempts: u32,
    pub ipv6_ready_attempts: u32,
    /// Pause between family readiness lookups (ms)
    pub ready_backoff_ms: u64,
    /// Where systemd unit files are written
    pub unit_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let readiness = ReadinessPolicy::default();
        Self {
            config_dir: PathBuf::from("/etc/tunwarden"),
            runtime_dir: PathBuf::from("/run/tunwarden"),
            backend: Backend::System,
            log_filter: "info".to_string(),
            service_poll_interval_ms: 1000,
            ipv4_ready_attempts: readiness.ipv4_attempts,
            ipv6_ready_attempts: readiness.ipv6_attempts,
            ready_backoff_ms: readiness.backoff.as_millis() as u64,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl Settings {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load a file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            Self::from_toml_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            ipv4_attempts: self.ipv4_ready_attempts,
            ipv6_attempts: self.ipv6_ready_attempts,
            backoff: Duration::from_millis(self.ready_backoff_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.service_poll_interval_ms)
    }

    pub fn socket_paths(&self) -> SocketPaths {
        SocketPaths::in_dir(&self.runtime_dir)
    }
}
