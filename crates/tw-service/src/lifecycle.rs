//! Service Lifecycle Manager
//!
//! Installs and removes the OS service registrations for the manager and
//! for each tunnel worker.
//!
//! Install never touches a service that is running. A stopped leftover is
//! deleted first, and install waits until the service manager has purged
//! it before registering the replacement.

use crate::error::ServiceError;
use crate::scm::{CachedConnection, ScmError, ServiceSpec, ServiceStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tw_net::TunnelName;

/// Registration name of the manager service
pub const MANAGER_SERVICE_NAME: &str = "Tunwarden Manager";

/// Prefix of tunnel worker registration names
pub const TUNNEL_SERVICE_PREFIX: &str = "Tunwarden Tunnel: ";

/// Argument selecting the manager role
pub const MANAGER_ROLE_ARG: &str = "manager-service";

/// Argument selecting the tunnel role
pub const TUNNEL_ROLE_ARG: &str = "tunnel-service";

/// What a service registration runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Manager,
    Tunnel {
        name: TunnelName,
        config_path: PathBuf,
    },
}

impl Role {
    /// Tunnel worker for a stored configuration path
    pub fn tunnel(config_path: &Path) -> Result<Self, ServiceError> {
        let name = TunnelName::from_path(config_path)?;
        Ok(Role::Tunnel {
            name,
            config_path: config_path.to_path_buf(),
        })
    }

    pub fn service_name(&self) -> String {
        match self {
            Role::Manager => MANAGER_SERVICE_NAME.to_string(),
            Role::Tunnel { name, .. } => tunnel_service_name(name),
        }
    }

    /// Command-line arguments the registered executable is started with
    pub fn args(&self) -> Vec<String> {
        match self {
            Role::Manager => vec![MANAGER_ROLE_ARG.to_string()],
            Role::Tunnel { config_path, .. } => vec![
                TUNNEL_ROLE_ARG.to_string(),
                config_path.display().to_string(),
            ],
        }
    }
}

/// Registration name of a tunnel's worker service
pub fn tunnel_service_name(name: &TunnelName) -> String {
    format!("{}{}", TUNNEL_SERVICE_PREFIX, name)
}

/// Installs and removes service registrations
pub struct ServiceLifecycle {
    scm: Arc<CachedConnection>,
    executable: PathBuf,
    poll_interval: Duration,
}

impl ServiceLifecycle {
    pub fn new(scm: Arc<CachedConnection>, executable: PathBuf, poll_interval: Duration) -> Self {
        Self {
            scm,
            executable,
            poll_interval,
        }
    }

    /// Service manager handle shared with the caller
    pub fn scm(&self) -> &Arc<CachedConnection> {
        &self.scm
    }

    /// Run state of a registration, `None` if absent
    pub fn status(&self, service_name: &str) -> Result<Option<ServiceStatus>, ServiceError> {
        Ok(self.scm.with(|scm| scm.status(service_name))?)
    }

    /// Register the role as an automatic-start service and start it
    pub fn install(&self, role: &Role) -> Result<(), ServiceError> {
        let name = role.service_name();

        if let Some(status) = self.status(&name)? {
            if status != ServiceStatus::Stopped {
                return Err(ServiceError::AlreadyRunning(name));
            }
            info!("Replacing stopped service {}", name);
            match self.scm.with(|scm| scm.delete(&name)) {
                Ok(()) | Err(ScmError::MarkedForDelete(_)) | Err(ScmError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.wait_until_gone(&name)?;
        }

        let spec = ServiceSpec {
            name: name.clone(),
            executable: self.executable.clone(),
            args: role.args(),
            auto_start: true,
        };
        self.scm.with(|scm| scm.create(&spec))?;
        self.scm.with(|scm| scm.start(&name))?;
        info!("Installed and started {}", name);
        Ok(())
    }

    /// Poll until a deleted registration is purged
    fn wait_until_gone(&self, name: &str) -> Result<(), ServiceError> {
        while self.status(name)?.is_some() {
            debug!("Waiting for {} to be purged", name);
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Stop and delete a registration
    ///
    /// Delete is attempted even if stop fails; both failures are reported.
    pub fn uninstall(&self, service_name: &str) -> Result<(), ServiceError> {
        if self.status(service_name)?.is_none() {
            return Err(ScmError::NotFound(service_name.to_string()).into());
        }

        let stop = self.scm.with(|scm| scm.stop(service_name)).err();
        if let Some(e) = &stop {
            warn!("Failed to stop {}: {}", service_name, e);
        }
        let delete = self.scm.with(|scm| scm.delete(service_name)).err();

        match (stop, delete) {
            (None, None) => {
                info!("Uninstalled {}", service_name);
                Ok(())
            }
            (stop, delete) => Err(ServiceError::Uninstall {
                name: service_name.to_string(),
                stop,
                delete,
            }),
        }
    }

    pub fn install_manager(&self) -> Result<(), ServiceError> {
        self.install(&Role::Manager)
    }

    pub fn uninstall_manager(&self) -> Result<(), ServiceError> {
        self.uninstall(MANAGER_SERVICE_NAME)
    }

    pub fn install_tunnel(&self, config_path: &Path) -> Result<(), ServiceError> {
        self.install(&Role::tunnel(config_path)?)
    }

    pub fn uninstall_tunnel(&self, name: &TunnelName) -> Result<(), ServiceError> {
        self.uninstall(&tunnel_service_name(name))
    }
}
