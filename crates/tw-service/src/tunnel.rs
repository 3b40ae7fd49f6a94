//! Tunnel worker role
//!
//! One worker per running tunnel. Brings the device up, applies the plan,
//! then holds the tunnel until a stop arrives and tears it down in reverse.

use crate::error::ServiceError;
use crate::host::{Control, ControlLoop};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tracing::{error, info, warn};
use tw_net::{plan_tunnel, DeviceProvider, InterfaceReconciler, TunnelConfig, TunnelDevice};

/// Runs one tunnel until stopped
pub struct TunnelService {
    config: TunnelConfig,
    devices: Arc<dyn DeviceProvider>,
    reconciler: Arc<InterfaceReconciler>,
}

impl TunnelService {
    pub fn new(
        config: TunnelConfig,
        devices: Arc<dyn DeviceProvider>,
        reconciler: Arc<InterfaceReconciler>,
    ) -> Self {
        Self {
            config,
            devices,
            reconciler,
        }
    }

    /// Undo everything and release the device
    fn teardown(&self, device: Box<dyn TunnelDevice>) -> Result<(), ServiceError> {
        let iface = device.interface().clone();
        let unconfigured = self.reconciler.unconfigure(&iface);
        if let Err(e) = self.devices.destroy(device) {
            error!("Failed to destroy device {}: {}", iface, e);
            unconfigured?;
            return Err(e.into());
        }
        Ok(unconfigured?)
    }
}

impl ControlLoop for TunnelService {
    fn run(self, controls: Receiver<Control>) -> Result<(), ServiceError> {
        let name = &self.config.name;
        let plan = plan_tunnel(&self.config);

        let mut device = self.devices.create(name)?;
        let iface = device.interface().clone();
        self.reconciler.wait_for_families(&iface);

        if let Err(e) = self.reconciler.enable_firewall(&iface, &plan) {
            if let Err(destroy) = self.devices.destroy(device) {
                warn!("Failed to destroy device {}: {}", iface, destroy);
            }
            return Err(e.into());
        }

        match self.reconciler.configure(device.as_mut(), &plan) {
            Ok(()) => {}
            Err(e) if e.is_partial() => warn!("Tunnel {} is up with errors: {}", name, e),
            Err(e) => {
                if let Err(teardown) = self.teardown(device) {
                    warn!("Cleanup after failed configure: {}", teardown);
                }
                return Err(e.into());
            }
        }

        info!("Tunnel {} up on {}", name, iface);
        // A dropped controller counts as a stop
        let _ = controls.recv();
        info!("Tunnel {} going down", name);
        self.teardown(device)
    }
}
