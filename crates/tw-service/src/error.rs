//! Service errors.

use crate::scm::ScmError;
use crate::store::StoreError;
use std::io;
use tw_ipc::IpcError;
use tw_net::{ConfigError, DeviceError, ReconcileError};

/// Errors from installing, hosting and running services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service {0} is already installed and running")]
    AlreadyRunning(String),

    #[error("Service manager error: {0}")]
    Scm(#[from] ScmError),

    #[error("Failed to uninstall {name}: {}", describe_uninstall(.stop, .delete))]
    Uninstall {
        name: String,
        stop: Option<ScmError>,
        delete: Option<ScmError>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Config store error: {0}")]
    Store(#[from] StoreError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Interface configuration failed: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn describe_uninstall(stop: &Option<ScmError>, delete: &Option<ScmError>) -> String {
    match (stop, delete) {
        (Some(s), Some(d)) => format!("stop: {}; delete: {}", s, d),
        (Some(s), None) => format!("stop: {}", s),
        (None, Some(d)) => format!("delete: {}", d),
        (None, None) => "no error".to_string(),
    }
}
