//! OS Network Stack Contract
//!
//! The operations the reconciler needs from the host's network stack,
//! scoped by interface and address family. Backends: [`MemoryStack`]
//! (in-process model) and, on Linux, `LinuxStack`.
//!
//! [`MemoryStack`]: crate::memory::MemoryStack

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// Address family selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Family of a prefix
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::Ipv4,
            IpNet::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Stable low-level identifier of a network interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    /// OS interface index
    pub index: u32,
    /// Interface name as the OS knows it
    pub name: String,
}

impl InterfaceId {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

/// A route submitted to the OS
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination prefix (network address, host bits cleared)
    pub destination: IpNet,
    /// Next hop on the tunnel interface
    pub next_hop: IpAddr,
    /// Route metric
    pub metric: u32,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} metric {}", self.destination, self.next_hop, self.metric)
    }
}

/// Per-family interface parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInterface {
    /// Which family these parameters belong to
    pub family: AddressFamily,
    /// Let the OS pick the interface metric
    pub use_automatic_metric: bool,
    /// Interface metric (ignored while automatic)
    pub metric: u32,
    /// Network-layer MTU
    pub mtu: u32,
    /// Duplicate address detection probes (IPv6)
    pub dad_transmits: u32,
    /// Accept router advertisements (IPv6)
    pub router_discovery: bool,
}

impl IpInterface {
    /// OS defaults for a freshly created interface
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            use_automatic_metric: true,
            metric: 0,
            mtu: 1500,
            dad_transmits: 1,
            router_discovery: true,
        }
    }
}

/// Operational status of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperStatus {
    Up,
    Down,
    Dormant,
    NotPresent,
    Unknown,
}

/// Snapshot of an interface and its unicast addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub id: InterfaceId,
    pub oper_status: OperStatus,
    /// Unicast addresses with their on-link prefix length
    pub addresses: Vec<IpNet>,
}

/// Network stack errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    /// The object (address, route) already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The interface or its per-family binding does not exist (yet)
    #[error("{0} not found")]
    NotFound(String),

    /// Any other failure reported by the OS
    #[error("{op} failed: {message}")]
    Os { op: &'static str, message: String },
}

impl StackError {
    pub fn os(op: &'static str, message: impl Into<String>) -> Self {
        StackError::Os {
            op,
            message: message.into(),
        }
    }
}

/// Operations the reconciler performs against the live network stack
pub trait NetworkStack: Send + Sync {
    /// Assign the given addresses to the interface
    fn set_addresses(&self, iface: &InterfaceId, addresses: &[IpNet]) -> Result<(), StackError>;

    /// Remove a single address from an interface
    fn delete_address(&self, iface: &InterfaceId, address: &IpNet) -> Result<(), StackError>;

    /// Remove every address of one family
    fn flush_addresses(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError>;

    /// Install a batch of routes
    fn set_routes(&self, iface: &InterfaceId, routes: &[Route]) -> Result<(), StackError>;

    /// Remove every route of one family
    fn flush_routes(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError>;

    /// Read per-family parameters; `NotFound` while the family is not bound
    fn ip_interface(
        &self,
        iface: &InterfaceId,
        family: AddressFamily,
    ) -> Result<IpInterface, StackError>;

    /// Write per-family parameters
    fn set_ip_interface(&self, iface: &InterfaceId, params: &IpInterface) -> Result<(), StackError>;

    /// Set the interface's DNS servers
    fn set_dns(&self, iface: &InterfaceId, servers: &[IpAddr]) -> Result<(), StackError>;

    /// Clear the interface's DNS servers
    fn flush_dns(&self, iface: &InterfaceId) -> Result<(), StackError>;

    /// Enumerate all interfaces with their status and addresses
    fn adapters(&self) -> Result<Vec<Adapter>, StackError>;
}
