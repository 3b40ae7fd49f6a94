//! tunwarden network layer
//!
//! Everything that touches (or models) the host network stack on behalf
//! of a tunnel.
//!
//! # Architecture
//!
//! ```text
//!  TunnelConfig ──▶ planner ──▶ InterfacePlan
//!                                    │
//!                                    ▼
//!                         InterfaceReconciler
//!                        ┌───────┬────┴───┬──────────┐
//!                        ▼       ▼        ▼          ▼
//!                  NetworkStack Firewall TunnelDevice (DeviceProvider)
//!                   │            │        │
//!                   ├ MemoryStack├ MemoryFirewall  ├ MemoryDevices
//!                   └ LinuxStack └ NftFirewall     └ TuntapDevices
//! ```
//!
//! The planner is pure; the reconciler applies a plan layer by layer and
//! never holds more than one reconciliation per interface in flight.

mod config;
mod device;
mod firewall;
mod keys;
mod memory;
mod planner;
mod reconciler;
mod stack;

#[cfg(target_os = "linux")]
mod linux;

pub use config::{
    ConfigError, InterfaceConfig, PeerConfig, TunnelConfig, TunnelName, CONFIG_EXTENSION,
    MAX_NAME_LEN,
};
pub use device::{DeviceError, DeviceProvider, MemoryDevice, MemoryDevices, TunnelDevice};
pub use firewall::{Firewall, FirewallError, FirewallPosture, FirewallState, MemoryFirewall};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use memory::{InterfaceSnapshot, MemoryStack};
pub use planner::{
    firewall_posture, plan, plan_tunnel, InterfacePlan, PlanWarning, RouteSet, MIN_METRIC,
};
pub use reconciler::{InterfaceReconciler, ReadinessPolicy, ReconcileError};
pub use stack::{
    Adapter, AddressFamily, InterfaceId, IpInterface, NetworkStack, OperStatus, Route, StackError,
};

#[cfg(target_os = "linux")]
pub use linux::{LinuxStack, NftFirewall, TuntapDevice, TuntapDevices, NFT_TABLE};
