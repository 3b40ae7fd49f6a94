//! tunwarden services
//!
//! The two privileged roles and what they need from the OS:
//!
//! - **manager**: serves the control protocol, keeps the tunnel state
//!   table and installs one worker service per running tunnel
//! - **tunnel**: a worker that owns one device and its interface state
//!
//! Both run inside a [`ServiceHost`], which turns OS stop requests into
//! [`Control`] messages for the role's control loop.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────── ServiceHost ────────────────┐
//!            │                                             │
//!      ManagerLoop ──▶ ManagerService ──▶ ServiceLifecycle ─┼─▶ CachedConnection
//!            │            │      │                          │      │
//!            │       TunnelTable ConfigStore               │      ├ SystemdScm
//!            │                                             │      └ MemoryScm
//!      TunnelService ──▶ InterfaceReconciler (tw-net)       │
//!            └─────────────────────────────────────────────┘
//! ```

mod error;
mod host;
mod lifecycle;
mod manager;
mod memory_scm;
mod scm;
mod settings;
mod state;
mod store;
mod systemd;
mod tunnel;

pub use error::ServiceError;
pub use host::{Control, ControlLoop, ServiceHost};
pub use lifecycle::{
    tunnel_service_name, Role, ServiceLifecycle, MANAGER_ROLE_ARG, MANAGER_SERVICE_NAME,
    TUNNEL_ROLE_ARG, TUNNEL_SERVICE_PREFIX,
};
pub use manager::{ManagerError, ManagerLoop, ManagerService};
pub use memory_scm::{MemoryConnector, MemoryScm};
pub use scm::{
    CachedConnection, ScmConnector, ScmError, ServiceControlManager, ServiceSpec, ServiceStatus,
};
pub use settings::{Backend, Settings, SettingsError, DEFAULT_SETTINGS_PATH};
pub use state::{transition, Operation, Seen, StateError, Step, TunnelTable};
pub use store::{ConfigStore, StoreError};
pub use systemd::{render_unit, unit_name, SystemdConnector, SystemdScm};
pub use tunnel::TunnelService;
