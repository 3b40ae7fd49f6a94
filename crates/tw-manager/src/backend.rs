//! Backend selection
//!
//! `system` drives the host (iproute2, nftables, systemd); `memory` keeps
//! everything in process for dry runs.

use anyhow::Result;
use std::sync::Arc;
use tw_net::{
    DeviceProvider, InterfaceReconciler, MemoryDevices, MemoryFirewall, MemoryStack,
};
use tw_service::{Backend, CachedConnection, MemoryConnector, MemoryScm, Settings, SystemdConnector};

/// Service-manager handle for the configured backend
pub fn scm(settings: &Settings) -> CachedConnection {
    match settings.backend {
        Backend::System => CachedConnection::new(SystemdConnector::new(settings.unit_dir.clone())),
        Backend::Memory => CachedConnection::new(MemoryConnector(Arc::new(MemoryScm::new()))),
    }
}

/// Device provider and reconciler for a tunnel worker
pub fn network(settings: &Settings) -> Result<(Arc<dyn DeviceProvider>, Arc<InterfaceReconciler>)> {
    match settings.backend {
        Backend::System => system_network(settings),
        Backend::Memory => {
            let stack = Arc::new(MemoryStack::new());
            let devices: Arc<dyn DeviceProvider> =
                Arc::new(MemoryDevices::attached_to(Arc::clone(&stack)));
            let reconciler = InterfaceReconciler::new(stack, Arc::new(MemoryFirewall::new()))
                .with_readiness(settings.readiness());
            Ok((devices, Arc::new(reconciler)))
        }
    }
}

#[cfg(target_os = "linux")]
fn system_network(settings: &Settings) -> Result<(Arc<dyn DeviceProvider>, Arc<InterfaceReconciler>)> {
    use tw_net::{LinuxStack, NftFirewall, TuntapDevices};

    let reconciler = InterfaceReconciler::new(Arc::new(LinuxStack::new()), Arc::new(NftFirewall::new()))
        .with_readiness(settings.readiness());
    let devices: Arc<dyn DeviceProvider> = Arc::new(TuntapDevices::new());
    Ok((devices, Arc::new(reconciler)))
}

#[cfg(not(target_os = "linux"))]
fn system_network(_settings: &Settings) -> Result<(Arc<dyn DeviceProvider>, Arc<InterfaceReconciler>)> {
    anyhow::bail!("the system backend is only available on Linux; set backend = \"memory\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_service::ServiceControlManager;

    #[test]
    fn test_memory_backend_connects() {
        let settings = Settings {
            backend: Backend::Memory,
            ..Settings::default()
        };
        let connection = scm(&settings);
        assert_eq!(connection.get().unwrap().status("Tunwarden Manager").unwrap(), None);
        assert!(network(&settings).is_ok());
    }
}
