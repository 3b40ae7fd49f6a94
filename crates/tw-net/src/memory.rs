//! In-Memory Network Stack
//!
//! A model of the host network stack that keeps interfaces, addresses,
//! routes, per-family parameters and DNS in process memory. It backs the
//! `memory` backend and lets tests stage the races the reconciler has to
//! survive: address conflicts with dead interfaces, late family binding,
//! a disabled IPv6 stack and failing route batches.

use crate::stack::{
    Adapter, AddressFamily, InterfaceId, IpInterface, NetworkStack, OperStatus, Route, StackError,
};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// State of one modelled interface
#[derive(Debug, Clone)]
pub struct InterfaceSnapshot {
    pub id: InterfaceId,
    pub oper_status: OperStatus,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<Route>,
    pub ipv4: Option<IpInterface>,
    pub ipv6: Option<IpInterface>,
    pub dns: Vec<IpAddr>,
}

#[derive(Debug, Default)]
struct Inner {
    interfaces: HashMap<u32, InterfaceSnapshot>,
    /// Remaining `NotFound` answers before a family binds
    pending_probes: HashMap<(u32, AddressFamily), u32>,
    probes: HashMap<(u32, AddressFamily), u32>,
    address_calls: u32,
    fail_routes: bool,
}

/// In-process [`NetworkStack`]
#[derive(Debug, Default)]
pub struct MemoryStack {
    inner: Mutex<Inner>,
}

impl MemoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface with both families bound
    pub fn add_interface(&self, id: InterfaceId, oper_status: OperStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.interfaces.insert(
            id.index,
            InterfaceSnapshot {
                id,
                oper_status,
                addresses: Vec::new(),
                routes: Vec::new(),
                ipv4: Some(IpInterface::new(AddressFamily::Ipv4)),
                ipv6: Some(IpInterface::new(AddressFamily::Ipv6)),
                dns: Vec::new(),
            },
        );
    }

    /// Register an interface that already holds addresses
    pub fn add_interface_with_addresses(
        &self,
        id: InterfaceId,
        oper_status: OperStatus,
        addresses: Vec<IpNet>,
    ) {
        let index = id.index;
        self.add_interface(id, oper_status);
        if let Some(iface) = self.inner.lock().unwrap().interfaces.get_mut(&index) {
            iface.addresses = addresses;
        }
    }

    /// Remove an interface entirely (device destroyed)
    pub fn remove_interface(&self, index: u32) -> Option<InterfaceSnapshot> {
        self.inner.lock().unwrap().interfaces.remove(&index)
    }

    /// Make the family answer `NotFound` for the next `probes` lookups
    pub fn delay_family(&self, index: u32, family: AddressFamily, probes: u32) {
        self.inner
            .lock()
            .unwrap()
            .pending_probes
            .insert((index, family), probes);
    }

    /// Unbind IPv6 from an interface, as on hosts with IPv6 disabled
    pub fn disable_ipv6(&self, index: u32) {
        if let Some(iface) = self.inner.lock().unwrap().interfaces.get_mut(&index) {
            iface.ipv6 = None;
        }
    }

    /// Make every route batch fail
    pub fn fail_routes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_routes = fail;
    }

    /// Copy of an interface's state
    pub fn snapshot(&self, index: u32) -> Option<InterfaceSnapshot> {
        self.inner.lock().unwrap().interfaces.get(&index).cloned()
    }

    /// How many times a family was looked up
    pub fn probe_count(&self, index: u32, family: AddressFamily) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .probes
            .get(&(index, family))
            .copied()
            .unwrap_or(0)
    }

    /// How many times addresses were applied
    pub fn address_calls(&self) -> u32 {
        self.inner.lock().unwrap().address_calls
    }
}

fn missing(iface: &InterfaceId) -> StackError {
    StackError::NotFound(format!("interface {}", iface))
}

impl NetworkStack for MemoryStack {
    fn set_addresses(&self, iface: &InterfaceId, addresses: &[IpNet]) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        inner.address_calls += 1;
        if !inner.interfaces.contains_key(&iface.index) {
            return Err(missing(iface));
        }
        let conflict = inner
            .interfaces
            .values()
            .filter(|other| other.id.index != iface.index)
            .flat_map(|other| other.addresses.iter())
            .find(|held| addresses.contains(held));
        if let Some(held) = conflict {
            return Err(StackError::AlreadyExists(format!("address {}", held)));
        }
        if let Some(entry) = inner.interfaces.get_mut(&iface.index) {
            entry.addresses = addresses.to_vec();
        }
        Ok(())
    }

    fn delete_address(&self, iface: &InterfaceId, address: &IpNet) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        let before = entry.addresses.len();
        entry.addresses.retain(|a| a != address);
        if entry.addresses.len() == before {
            return Err(StackError::NotFound(format!("address {}", address)));
        }
        Ok(())
    }

    fn flush_addresses(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        entry.addresses.retain(|a| AddressFamily::of_net(a) != family);
        Ok(())
    }

    fn set_routes(&self, iface: &InterfaceId, routes: &[Route]) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_routes {
            return Err(StackError::os("set routes", "route table rejected the batch"));
        }
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        entry.routes = routes.to_vec();
        Ok(())
    }

    fn flush_routes(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        entry
            .routes
            .retain(|r| AddressFamily::of_net(&r.destination) != family);
        Ok(())
    }

    fn ip_interface(
        &self,
        iface: &InterfaceId,
        family: AddressFamily,
    ) -> Result<IpInterface, StackError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (iface.index, family);
        *inner.probes.entry(key).or_insert(0) += 1;
        if let Some(remaining) = inner.pending_probes.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StackError::NotFound(format!("{} binding of {}", family, iface)));
            }
        }
        let entry = inner.interfaces.get(&iface.index).ok_or_else(|| missing(iface))?;
        let params = match family {
            AddressFamily::Ipv4 => entry.ipv4.clone(),
            AddressFamily::Ipv6 => entry.ipv6.clone(),
        };
        params.ok_or_else(|| StackError::NotFound(format!("{} binding of {}", family, iface)))
    }

    fn set_ip_interface(&self, iface: &InterfaceId, params: &IpInterface) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        let slot = match params.family {
            AddressFamily::Ipv4 => &mut entry.ipv4,
            AddressFamily::Ipv6 => &mut entry.ipv6,
        };
        match slot {
            Some(current) => {
                *current = params.clone();
                Ok(())
            }
            None => Err(StackError::NotFound(format!("{} binding of {}", params.family, iface))),
        }
    }

    fn set_dns(&self, iface: &InterfaceId, servers: &[IpAddr]) -> Result<(), StackError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.interfaces.get_mut(&iface.index).ok_or_else(|| missing(iface))?;
        entry.dns = servers.to_vec();
        Ok(())
    }

    fn flush_dns(&self, iface: &InterfaceId) -> Result<(), StackError> {
        self.set_dns(iface, &[])
    }

    fn adapters(&self) -> Result<Vec<Adapter>, StackError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .interfaces
            .values()
            .map(|i| Adapter {
                id: i.id.clone(),
                oper_status: i.oper_status,
                addresses: i.addresses.clone(),
            })
            .collect())
    }
}
