//! Service Control Manager Contract
//!
//! The OS facility that registers, starts, stops and deletes background
//! services. Backends connect lazily through [`CachedConnection`], which
//! keeps one process-wide handle and drops it when the connection itself
//! fails, so the next operation reconnects instead of reusing a dead
//! handle.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Run state of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    StartPending,
    StopPending,
    Running,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::StartPending => write!(f, "start pending"),
            Self::StopPending => write!(f, "stop pending"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Registration request for a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name, also shown to administrators
    pub name: String,
    /// Executable the service runs
    pub executable: PathBuf,
    /// Arguments selecting the role
    pub args: Vec<String>,
    /// Start with the system
    pub auto_start: bool,
}

/// Service control errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScmError {
    #[error("Service {0} does not exist")]
    NotFound(String),

    #[error("Service {0} already exists")]
    AlreadyExists(String),

    #[error("Service {0} is marked for deletion")]
    MarkedForDelete(String),

    #[error("Service manager connection failed: {0}")]
    Connection(String),

    #[error("Service manager error: {0}")]
    Backend(String),
}

impl ScmError {
    /// The handle to the service manager is unusable
    pub fn is_connection(&self) -> bool {
        matches!(self, ScmError::Connection(_))
    }
}

/// Operations on service registrations
pub trait ServiceControlManager: Send + Sync {
    /// Current state, or `None` if no registration exists
    fn status(&self, name: &str) -> Result<Option<ServiceStatus>, ScmError>;

    /// Register a service (not started)
    fn create(&self, spec: &ServiceSpec) -> Result<(), ScmError>;

    fn start(&self, name: &str) -> Result<(), ScmError>;

    /// Ask the service to stop; stopping a stopped service succeeds
    fn stop(&self, name: &str) -> Result<(), ScmError>;

    /// Remove the registration; it may linger until fully purged
    fn delete(&self, name: &str) -> Result<(), ScmError>;
}

/// Opens handles to a service manager
pub trait ScmConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn ServiceControlManager>, ScmError>;
}

/// Lazily established, reusable service-manager handle
pub struct CachedConnection {
    connector: Box<dyn ScmConnector>,
    handle: Mutex<Option<Arc<dyn ServiceControlManager>>>,
}

impl CachedConnection {
    pub fn new(connector: impl ScmConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            handle: Mutex::new(None),
        }
    }

    /// Current handle, connecting on first use
    pub fn get(&self) -> Result<Arc<dyn ServiceControlManager>, ScmError> {
        let mut handle = self.handle.lock().unwrap();
        if let Some(scm) = handle.as_ref() {
            return Ok(Arc::clone(scm));
        }
        debug!("Connecting to service manager");
        let scm = self.connector.connect()?;
        *handle = Some(Arc::clone(&scm));
        Ok(scm)
    }

    /// Forget the cached handle
    pub fn invalidate(&self) {
        self.handle.lock().unwrap().take();
    }

    /// Run an operation, dropping the handle if the connection failed
    pub fn with<T>(
        &self,
        op: impl FnOnce(&dyn ServiceControlManager) -> Result<T, ScmError>,
    ) -> Result<T, ScmError> {
        let scm = self.get()?;
        let result = op(scm.as_ref());
        if let Err(e) = &result {
            if e.is_connection() {
                warn!("Dropping service manager handle: {}", e);
                self.invalidate();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_scm::MemoryScm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        scm: Arc<MemoryScm>,
        connects: Arc<AtomicUsize>,
    }

    impl ScmConnector for Counting {
        fn connect(&self) -> Result<Arc<dyn ServiceControlManager>, ScmError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.scm.clone())
        }
    }

    fn cached() -> (CachedConnection, Arc<MemoryScm>, Arc<AtomicUsize>) {
        let scm = Arc::new(MemoryScm::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let conn = CachedConnection::new(Counting {
            scm: Arc::clone(&scm),
            connects: Arc::clone(&connects),
        });
        (conn, scm, connects)
    }

    #[test]
    fn test_connects_once_and_reuses() {
        let (conn, _, connects) = cached();
        conn.with(|scm| scm.status("a")).unwrap();
        conn.with(|scm| scm.status("b")).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_error_invalidates() {
        let (conn, scm, connects) = cached();
        scm.fail_next(ScmError::Connection("pipe closed".into()));

        assert!(conn.with(|scm| scm.status("a")).is_err());
        conn.with(|scm| scm.status("a")).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_other_errors_keep_handle() {
        let (conn, _, connects) = cached();
        assert!(conn.with(|scm| scm.start("missing")).is_err());
        conn.with(|scm| scm.status("a")).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}
