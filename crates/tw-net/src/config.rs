//! Tunnel Configuration
//!
//! The immutable configuration a tunnel is started from: interface
//! addresses, DNS, MTU and the peer list with allowed-IP prefixes. Parsing
//! user-facing config formats is someone else's job; these types are the
//! narrow contract the planner and the manager consume.

use crate::keys::{PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Longest accepted tunnel name
pub const MAX_NAME_LEN: usize = 32;

/// File extension of stored tunnel configs
pub const CONFIG_EXTENSION: &str = "toml";

/// Unique, restart-stable tunnel identity
///
/// Used both as the OS service name suffix and as the key for every
/// control-protocol call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelName(String);

impl TunnelName {
    /// Validate and wrap a tunnel name
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ConfigError::InvalidName(name));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));
        if !valid {
            return Err(ConfigError::InvalidName(name));
        }
        Ok(Self(name))
    }

    /// Derive the tunnel identity from a stored config's path
    ///
    /// `/etc/tunwarden/office.toml` names the tunnel `office`.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let has_extension = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(CONFIG_EXTENSION));
        if !has_extension {
            return Err(ConfigError::InvalidPath(path.display().to_string()));
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?;
        Self::new(stem)
    }

    /// Borrow the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TunnelName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TunnelName> for String {
    fn from(name: TunnelName) -> Self {
        name.0
    }
}

/// Interface section of a tunnel config
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Our private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Addresses assigned to the tunnel interface (address + prefix)
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// DNS servers to use while the tunnel is up
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Interface MTU (0 = leave the OS default)
    #[serde(default)]
    pub mtu: u16,
    /// UDP listen port for the tunnel transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

/// Peer section of a tunnel config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Peer's endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Prefixes this peer routes traffic for
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    /// Persistent keepalive interval (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Create a peer with no endpoint and no allowed IPs
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    /// Builder-style helper adding an allowed-IP prefix
    pub fn allow(mut self, prefix: IpNet) -> Self {
        self.allowed_ips.push(prefix);
        self
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel identity
    pub name: TunnelName,
    /// Interface settings
    #[serde(default)]
    pub interface: InterfaceConfig,
    /// Peers
    #[serde(default, rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfig {
    /// Create an empty configuration for a tunnel
    pub fn new(name: TunnelName) -> Self {
        Self {
            name,
            interface: InterfaceConfig::default(),
            peers: Vec::new(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.mtu != 0 && self.interface.mtu < 576 {
            return Err(ConfigError::InvalidMtu(self.interface.mtu));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if self.peers[..i].iter().any(|p| p.public_key == peer.public_key) {
                return Err(ConfigError::DuplicatePeer(peer.public_key.to_base64()));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid tunnel name: {0:?}")]
    InvalidName(String),

    #[error("Not a tunnel config path: {0}")]
    InvalidPath(String),

    #[error("MTU {0} is below the IPv4 minimum of 576")]
    InvalidMtu(u16),

    #[error("Peer {0} appears more than once")]
    DuplicatePeer(String),
}
