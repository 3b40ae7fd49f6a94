//! Tunnel Device Contract
//!
//! The reconciler only needs two things from the device that carries the
//! encrypted transport: a stable interface identifier and a way to force
//! its MTU. Key exchange and packet flow stay behind this boundary.

use crate::config::TunnelName;
use crate::memory::MemoryStack;
use crate::stack::{InterfaceId, OperStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Device errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {0} already exists")]
    AlreadyExists(String),

    #[error("Device {0} not found")]
    NotFound(String),

    #[error("Device operation failed: {0}")]
    Backend(String),
}

/// A live tunnel device
pub trait TunnelDevice: Send {
    /// Interface the device is bound to
    fn interface(&self) -> &InterfaceId;

    /// Force the device's link MTU
    fn force_mtu(&mut self, mtu: u32) -> Result<(), DeviceError>;
}

/// Creates and destroys tunnel devices
pub trait DeviceProvider: Send + Sync {
    fn create(&self, name: &TunnelName) -> Result<Box<dyn TunnelDevice>, DeviceError>;

    fn destroy(&self, device: Box<dyn TunnelDevice>) -> Result<(), DeviceError>;
}

/// Device owned by [`MemoryDevices`]
pub struct MemoryDevice {
    iface: InterfaceId,
    mtus: Arc<Mutex<HashMap<u32, u32>>>,
}

impl TunnelDevice for MemoryDevice {
    fn interface(&self) -> &InterfaceId {
        &self.iface
    }

    fn force_mtu(&mut self, mtu: u32) -> Result<(), DeviceError> {
        self.mtus.lock().unwrap().insert(self.iface.index, mtu);
        Ok(())
    }
}

/// In-process device provider
///
/// Hands out increasing interface indexes and remembers which devices
/// are alive and which MTU they were forced to. When attached to a
/// [`MemoryStack`], created devices appear there as up interfaces.
pub struct MemoryDevices {
    next_index: AtomicU32,
    live: Mutex<HashMap<u32, InterfaceId>>,
    mtus: Arc<Mutex<HashMap<u32, u32>>>,
    stack: Option<Arc<MemoryStack>>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self {
            next_index: AtomicU32::new(100),
            live: Mutex::new(HashMap::new()),
            mtus: Arc::new(Mutex::new(HashMap::new())),
            stack: None,
        }
    }

    /// Mirror device creation and destruction into a modelled stack
    pub fn attached_to(stack: Arc<MemoryStack>) -> Self {
        Self {
            stack: Some(stack),
            ..Self::new()
        }
    }

    /// Interfaces of devices that were created and not destroyed
    pub fn live(&self) -> Vec<InterfaceId> {
        self.live.lock().unwrap().values().cloned().collect()
    }

    /// MTU last forced on a device
    pub fn forced_mtu(&self, index: u32) -> Option<u32> {
        self.mtus.lock().unwrap().get(&index).copied()
    }
}

impl Default for MemoryDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for MemoryDevices {
    fn create(&self, name: &TunnelName) -> Result<Box<dyn TunnelDevice>, DeviceError> {
        let mut live = self.live.lock().unwrap();
        if live.values().any(|iface| iface.name == name.as_str()) {
            return Err(DeviceError::AlreadyExists(name.to_string()));
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let iface = InterfaceId::new(index, name.as_str());
        live.insert(index, iface.clone());
        if let Some(stack) = &self.stack {
            stack.add_interface(iface.clone(), OperStatus::Up);
        }
        info!("Created device {}", iface);
        Ok(Box::new(MemoryDevice {
            iface,
            mtus: Arc::clone(&self.mtus),
        }))
    }

    fn destroy(&self, device: Box<dyn TunnelDevice>) -> Result<(), DeviceError> {
        let iface = device.interface().clone();
        self.live
            .lock()
            .unwrap()
            .remove(&iface.index)
            .ok_or_else(|| DeviceError::NotFound(iface.to_string()))?;
        if let Some(stack) = &self.stack {
            stack.remove_interface(iface.index);
        }
        info!("Destroyed device {}", iface);
        Ok(())
    }
}
