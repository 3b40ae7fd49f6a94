//! Firewall Posture
//!
//! Binary posture applied while a tunnel is up: either the firewall is
//! disabled, or it is enabled for one interface with a DNS allow-list and
//! an optional "restrict-all" mode that blocks traffic escaping the tunnel.
//! There are no partial states.

use crate::stack::InterfaceId;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Firewall decision derived from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallPosture {
    /// Block everything that does not go through the tunnel
    pub restrict_all: bool,
    /// DNS servers that stay reachable
    pub dns: Vec<IpAddr>,
}

/// Observed firewall state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallState {
    /// No rules installed
    Disabled,
    /// Rules installed for an interface
    Enabled {
        iface: InterfaceId,
        posture: FirewallPosture,
    },
}

impl FirewallState {
    /// Check if traffic outside the tunnel is blocked
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            FirewallState::Enabled {
                posture: FirewallPosture {
                    restrict_all: true,
                    ..
                },
                ..
            }
        )
    }
}

/// Firewall errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FirewallError {
    #[error("Firewall already enabled for {0}")]
    AlreadyEnabled(String),

    #[error("Firewall backend failed: {0}")]
    Backend(String),
}

/// Firewall collaborator
pub trait Firewall: Send + Sync {
    /// Install rules for the interface
    fn enable(&self, iface: &InterfaceId, posture: &FirewallPosture) -> Result<(), FirewallError>;

    /// Remove every rule previously installed for the interface
    fn disable(&self, iface: &InterfaceId) -> Result<(), FirewallError>;
}

/// In-process firewall that only tracks the posture
///
/// Used by the `memory` backend and by tests.
pub struct MemoryFirewall {
    state: Mutex<FirewallState>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FirewallState::Disabled),
        }
    }

    /// Check current state
    pub fn state(&self) -> FirewallState {
        self.state.lock().unwrap().clone()
    }
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall for MemoryFirewall {
    fn enable(&self, iface: &InterfaceId, posture: &FirewallPosture) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        if let FirewallState::Enabled { iface: current, .. } = &*state {
            if current != iface {
                return Err(FirewallError::AlreadyEnabled(current.to_string()));
            }
        }
        info!(
            "Firewall enabled on {} (restrict all: {}, {} DNS servers)",
            iface,
            posture.restrict_all,
            posture.dns.len()
        );
        *state = FirewallState::Enabled {
            iface: iface.clone(),
            posture: posture.clone(),
        };
        Ok(())
    }

    fn disable(&self, iface: &InterfaceId) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        debug!("Firewall disabled for {}", iface);
        *state = FirewallState::Disabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(index: u32) -> InterfaceId {
        InterfaceId::new(index, format!("tw{}", index))
    }

    #[test]
    fn test_firewall_starts_disabled() {
        let fw = MemoryFirewall::new();
        assert_eq!(fw.state(), FirewallState::Disabled);
        assert!(!fw.state().is_blocking());
    }

    #[test]
    fn test_restrict_all_blocks() {
        let fw = MemoryFirewall::new();
        let posture = FirewallPosture {
            restrict_all: true,
            dns: vec!["1.1.1.1".parse().unwrap()],
        };

        fw.enable(&iface(1), &posture).unwrap();
        assert!(fw.state().is_blocking());

        fw.disable(&iface(1)).unwrap();
        assert_eq!(fw.state(), FirewallState::Disabled);
    }

    #[test]
    fn test_second_interface_rejected() {
        let fw = MemoryFirewall::new();
        fw.enable(&iface(1), &FirewallPosture::default()).unwrap();

        let result = fw.enable(&iface(2), &FirewallPosture::default());
        assert!(matches!(result, Err(FirewallError::AlreadyEnabled(_))));

        // Re-enabling the same interface updates the posture
        assert!(fw.enable(&iface(1), &FirewallPosture::default()).is_ok());
    }
}
