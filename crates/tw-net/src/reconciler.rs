//! Interface Reconciler
//!
//! Applies an [`InterfacePlan`] to one live interface and tears it down
//! again. The apply is layered and best-effort rather than transactional:
//!
//! 1. addresses (one cleanup-and-retry on conflicts with dead interfaces)
//! 2. routes, as one batch
//! 3. IPv4 then IPv6 interface parameters (metric, MTU, discovery)
//! 4. DNS
//!
//! A failed route batch does not undo the addresses; the next pass is
//! expected to repair it. Reconciliation of one interface is never
//! reentrant.

use crate::device::{DeviceError, TunnelDevice};
use crate::firewall::{Firewall, FirewallError};
use crate::planner::{InterfacePlan, PlanWarning};
use crate::stack::{AddressFamily, InterfaceId, NetworkStack, OperStatus, StackError};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded polling for family bindings after a device is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Lookups of the IPv4 binding before giving up
    pub ipv4_attempts: u32,
    /// Lookups of the IPv6 binding before giving up
    pub ipv6_attempts: u32,
    /// Pause between lookups
    pub backoff: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            ipv4_attempts: 100,
            ipv6_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Reconciliation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Reconciliation already in progress for {0}")]
    Busy(String),

    #[error("Failed to set addresses: {0}")]
    Addresses(StackError),

    #[error("Failed to set routes (addresses left applied): {0}")]
    Routes(StackError),

    #[error("Failed to configure {family} interface: {source}")]
    InterfaceParams {
        family: AddressFamily,
        source: StackError,
    },

    #[error("IPv6 is required by the configuration but unavailable: {0}")]
    Ipv6Unavailable(StackError),

    #[error("Failed to set DNS: {0}")]
    Dns(StackError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Firewall error: {0}")]
    Firewall(#[from] FirewallError),

    #[error("Teardown incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

impl ReconcileError {
    /// State was partly applied and a later pass can repair it
    pub fn is_partial(&self) -> bool {
        matches!(self, ReconcileError::Routes(_))
    }
}

/// Applies plans to live interfaces
pub struct InterfaceReconciler {
    stack: Arc<dyn NetworkStack>,
    firewall: Arc<dyn Firewall>,
    readiness: ReadinessPolicy,
    in_flight: Mutex<HashSet<u32>>,
}

/// Marks an interface busy until dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<u32>>,
    index: u32,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.index);
    }
}

impl InterfaceReconciler {
    pub fn new(stack: Arc<dyn NetworkStack>, firewall: Arc<dyn Firewall>) -> Self {
        Self {
            stack,
            firewall,
            readiness: ReadinessPolicy::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Override the readiness polling policy
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    fn begin(&self, iface: &InterfaceId) -> Result<InFlight<'_>, ReconcileError> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(iface.index) {
            return Err(ReconcileError::Busy(iface.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            index: iface.index,
        })
    }

    /// Wait for the OS to bind IPv4 and IPv6 to a freshly created device
    ///
    /// The family binding can lag device creation. Polls each family a
    /// bounded number of times and carries on regardless of the outcome.
    pub fn wait_for_families(&self, iface: &InterfaceId) {
        self.wait_for_family(iface, AddressFamily::Ipv4, self.readiness.ipv4_attempts);
        self.wait_for_family(iface, AddressFamily::Ipv6, self.readiness.ipv6_attempts);
    }

    fn wait_for_family(&self, iface: &InterfaceId, family: AddressFamily, attempts: u32) {
        for attempt in 1..=attempts {
            match self.stack.ip_interface(iface, family) {
                Err(StackError::NotFound(_)) if attempt < attempts => {
                    thread::sleep(self.readiness.backoff);
                }
                Err(StackError::NotFound(_)) => {
                    debug!("{} binding of {} not ready after {} attempts", family, iface, attempts);
                }
                _ => return,
            }
        }
    }

    /// Install the firewall posture for the interface
    pub fn enable_firewall(
        &self,
        iface: &InterfaceId,
        plan: &InterfacePlan,
    ) -> Result<(), ReconcileError> {
        if plan.warnings.contains(&PlanWarning::RestrictAllWithoutDns) {
            warn!(
                "No DNS server specified for {} despite a full-tunnel allowed IP; there may be connectivity issues",
                iface
            );
        }
        self.firewall.enable(iface, &plan.firewall)?;
        Ok(())
    }

    /// Apply addresses, routes, interface parameters and DNS
    pub fn configure(
        &self,
        device: &mut dyn TunnelDevice,
        plan: &InterfacePlan,
    ) -> Result<(), ReconcileError> {
        let iface = device.interface().clone();
        let _guard = self.begin(&iface)?;
        info!(
            "Configuring {} ({} addresses, {} routes)",
            iface,
            plan.addresses.len(),
            plan.routes.len()
        );

        self.apply_addresses(&iface, &plan.addresses)?;

        let route_failure = match self.stack.set_routes(&iface, plan.routes.as_slice()) {
            Ok(()) => None,
            Err(e) => {
                error!("Route batch for {} failed, continuing: {}", iface, e);
                Some(e)
            }
        };

        self.apply_ipv4(device, &iface, plan)?;
        self.apply_ipv6(&iface, plan)?;

        self.stack
            .set_dns(&iface, &plan.dns)
            .map_err(ReconcileError::Dns)?;

        match route_failure {
            Some(e) => Err(ReconcileError::Routes(e)),
            None => {
                info!("Configured {}", iface);
                Ok(())
            }
        }
    }

    fn apply_addresses(&self, iface: &InterfaceId, addresses: &[IpNet]) -> Result<(), ReconcileError> {
        match self.stack.set_addresses(iface, addresses) {
            Err(StackError::AlreadyExists(what)) => {
                debug!("{} on {}, cleaning up dead interfaces and retrying", what, iface);
                self.cleanup_stale_addresses(addresses);
                self.stack
                    .set_addresses(iface, addresses)
                    .map_err(ReconcileError::Addresses)
            }
            other => other.map_err(ReconcileError::Addresses),
        }
    }

    /// Remove our addresses from interfaces that are not up
    fn cleanup_stale_addresses(&self, addresses: &[IpNet]) {
        if addresses.is_empty() {
            return;
        }
        let adapters = match self.stack.adapters() {
            Ok(adapters) => adapters,
            Err(e) => {
                warn!("Unable to enumerate interfaces for stale address cleanup: {}", e);
                return;
            }
        };
        // Quadratic, but both sides hold a handful of entries
        for adapter in adapters.iter().filter(|a| a.oper_status != OperStatus::Up) {
            for held in adapter.addresses.iter().filter(|held| includes(addresses, held)) {
                warn!("Cleaning up stale address {} from interface {}", held, adapter.id);
                if let Err(e) = self.stack.delete_address(&adapter.id, held) {
                    warn!("Failed to remove stale address {} from {}: {}", held, adapter.id, e);
                }
            }
        }
    }

    fn apply_ipv4(
        &self,
        device: &mut dyn TunnelDevice,
        iface: &InterfaceId,
        plan: &InterfacePlan,
    ) -> Result<(), ReconcileError> {
        let family = AddressFamily::Ipv4;
        let mut params = self
            .stack
            .ip_interface(iface, family)
            .map_err(|source| ReconcileError::InterfaceParams { family, source })?;
        plan.apply_params(&mut params);
        if let Some(mtu) = plan.mtu {
            device.force_mtu(mtu)?;
        }
        self.stack
            .set_ip_interface(iface, &params)
            .map_err(|source| ReconcileError::InterfaceParams { family, source })
    }

    fn apply_ipv6(&self, iface: &InterfaceId, plan: &InterfacePlan) -> Result<(), ReconcileError> {
        let family = AddressFamily::Ipv6;
        let mut params = match self.stack.ip_interface(iface, family) {
            Ok(params) => params,
            Err(e) if plan.gateway_v6.is_some() => {
                error!("IPv6 binding missing on {}; is IPv6 disabled on this host?", iface);
                return Err(ReconcileError::Ipv6Unavailable(e));
            }
            Err(e) => {
                warn!("Skipping IPv6 configuration of {}: {}", iface, e);
                return Ok(());
            }
        };
        plan.apply_params(&mut params);
        self.stack
            .set_ip_interface(iface, &params)
            .map_err(|source| ReconcileError::InterfaceParams { family, source })
    }

    /// Flush routes, addresses and DNS, then drop the firewall rules
    ///
    /// Must run before the device is destroyed: interfaces that still carry
    /// routes when they disappear leave the stack in a bad state. Every step
    /// is attempted even if an earlier one fails.
    pub fn unconfigure(&self, iface: &InterfaceId) -> Result<(), ReconcileError> {
        let _guard = self.begin(iface)?;
        let mut failures = Vec::new();

        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            if let Err(e) = self.stack.flush_routes(iface, family) {
                failures.push(format!("flush {} routes: {}", family, e));
            }
            if let Err(e) = self.stack.flush_addresses(iface, family) {
                failures.push(format!("flush {} addresses: {}", family, e));
            }
        }
        if let Err(e) = self.stack.flush_dns(iface) {
            failures.push(format!("flush DNS: {}", e));
        }
        if let Err(e) = self.firewall.disable(iface) {
            failures.push(format!("disable firewall: {}", e));
        }

        if failures.is_empty() {
            info!("Unconfigured {}", iface);
            Ok(())
        } else {
            for failure in &failures {
                warn!("Teardown of {}: {}", iface, failure);
            }
            Err(ReconcileError::Teardown(failures))
        }
    }
}

/// Same address and prefix length, comparing IPv4-mapped IPv6 as IPv4
fn includes(addresses: &[IpNet], candidate: &IpNet) -> bool {
    let candidate_ip = canonical(candidate.addr());
    addresses
        .iter()
        .any(|a| canonical(a.addr()) == candidate_ip && a.prefix_len() == candidate.prefix_len())
}

fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}
