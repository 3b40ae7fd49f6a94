//! In-process service manager.
//!
//! Registrations are plain map entries. Deleted registrations can be made
//! to linger for a number of status queries, the way a real service
//! manager keeps a registration around until every handle to it closes.

use crate::scm::{ScmConnector, ScmError, ServiceControlManager, ServiceSpec, ServiceStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone)]
struct Registration {
    spec: ServiceSpec,
    status: ServiceStatus,
    /// Status queries left before a deleted entry disappears
    lingering: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<String, Registration>,
    linger: u32,
    fail_next: Option<ScmError>,
    fail_stop: Option<ScmError>,
    fail_start: Option<ScmError>,
    fail_create: Option<ScmError>,
    creates: u32,
}

/// [`ServiceControlManager`] kept in memory
#[derive(Debug, Default)]
pub struct MemoryScm {
    inner: Mutex<Inner>,
}

impl MemoryScm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep deleted registrations visible for `queries` status calls
    pub fn with_linger(self, queries: u32) -> Self {
        self.inner.lock().unwrap().linger = queries;
        self
    }

    /// Fail the next operation with the given error
    pub fn fail_next(&self, error: ScmError) {
        self.inner.lock().unwrap().fail_next = Some(error);
    }

    /// Fail the next `stop` call with the given error
    pub fn fail_next_stop(&self, error: ScmError) {
        self.inner.lock().unwrap().fail_stop = Some(error);
    }

    /// Fail the next `create` call with the given error
    pub fn fail_next_create(&self, error: ScmError) {
        self.inner.lock().unwrap().fail_create = Some(error);
    }

    /// Make the next `start` report failure while the service keeps
    /// starting, as a start that timed out does
    pub fn fail_next_start(&self, error: ScmError) {
        self.inner.lock().unwrap().fail_start = Some(error);
    }

    /// Force a registration into a state
    pub fn set_status(&self, name: &str, status: ServiceStatus) {
        if let Some(reg) = self.inner.lock().unwrap().services.get_mut(name) {
            reg.status = status;
        }
    }

    /// Spec of a live (not deleted) registration
    pub fn spec(&self, name: &str) -> Option<ServiceSpec> {
        self.inner
            .lock()
            .unwrap()
            .services
            .get(name)
            .filter(|reg| reg.lingering.is_none())
            .map(|reg| reg.spec.clone())
    }

    /// Live registrations
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .services
            .values()
            .filter(|reg| reg.lingering.is_none())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `create` calls so far
    pub fn creates(&self) -> u32 {
        self.inner.lock().unwrap().creates
    }

    fn take_failure(inner: &mut Inner) -> Result<(), ScmError> {
        match inner.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ServiceControlManager for MemoryScm {
    fn status(&self, name: &str) -> Result<Option<ServiceStatus>, ScmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        let Some(reg) = inner.services.get(name) else {
            return Ok(None);
        };
        let (status, lingering) = (reg.status, reg.lingering);
        match lingering {
            Some(0) => {
                inner.services.remove(name);
                debug!("Registration {} purged", name);
                Ok(None)
            }
            Some(left) => {
                if let Some(reg) = inner.services.get_mut(name) {
                    reg.lingering = Some(left - 1);
                }
                Ok(Some(status))
            }
            None => Ok(Some(status)),
        }
    }

    fn create(&self, spec: &ServiceSpec) -> Result<(), ScmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        if let Some(e) = inner.fail_create.take() {
            return Err(e);
        }
        if let Some(reg) = inner.services.get(&spec.name) {
            return Err(match reg.lingering {
                Some(_) => ScmError::MarkedForDelete(spec.name.clone()),
                None => ScmError::AlreadyExists(spec.name.clone()),
            });
        }
        inner.services.insert(
            spec.name.clone(),
            Registration {
                spec: spec.clone(),
                status: ServiceStatus::Stopped,
                lingering: None,
            },
        );
        inner.creates += 1;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), ScmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        let fail_start = inner.fail_start.take();
        match inner.services.get_mut(name) {
            Some(reg) if reg.lingering.is_none() => {
                if let Some(e) = fail_start {
                    reg.status = ServiceStatus::StartPending;
                    return Err(e);
                }
                reg.status = ServiceStatus::Running;
                Ok(())
            }
            Some(_) => Err(ScmError::MarkedForDelete(name.to_string())),
            None => Err(ScmError::NotFound(name.to_string())),
        }
    }

    fn stop(&self, name: &str) -> Result<(), ScmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        if let Some(e) = inner.fail_stop.take() {
            return Err(e);
        }
        let reg = inner
            .services
            .get_mut(name)
            .ok_or_else(|| ScmError::NotFound(name.to_string()))?;
        reg.status = ServiceStatus::Stopped;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), ScmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_failure(&mut inner)?;
        let linger = inner.linger;
        let reg = inner
            .services
            .get_mut(name)
            .ok_or_else(|| ScmError::NotFound(name.to_string()))?;
        if reg.lingering.is_some() {
            return Err(ScmError::MarkedForDelete(name.to_string()));
        }
        if linger > 0 {
            reg.lingering = Some(linger);
        } else {
            inner.services.remove(name);
        }
        Ok(())
    }
}

/// Hands out one shared [`MemoryScm`]
#[derive(Clone)]
pub struct MemoryConnector(pub Arc<MemoryScm>);

impl ScmConnector for MemoryConnector {
    fn connect(&self) -> Result<Arc<dyn ServiceControlManager>, ScmError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            executable: PathBuf::from("/usr/bin/tunwarden"),
            args: vec!["manager-service".to_string()],
            auto_start: true,
        }
    }

    #[test]
    fn test_register_start_stop() {
        let scm = MemoryScm::new();
        scm.create(&spec("svc")).unwrap();
        assert_eq!(scm.status("svc").unwrap(), Some(ServiceStatus::Stopped));

        scm.start("svc").unwrap();
        assert_eq!(scm.status("svc").unwrap(), Some(ServiceStatus::Running));
        assert!(matches!(scm.create(&spec("svc")), Err(ScmError::AlreadyExists(_))));

        scm.stop("svc").unwrap();
        scm.stop("svc").unwrap();
        assert_eq!(scm.status("svc").unwrap(), Some(ServiceStatus::Stopped));
    }

    #[test]
    fn test_failed_start_keeps_starting() {
        let scm = MemoryScm::new();
        scm.create(&spec("svc")).unwrap();
        scm.fail_next_start(ScmError::Backend("timed out".into()));

        assert!(matches!(scm.start("svc"), Err(ScmError::Backend(_))));
        assert_eq!(scm.status("svc").unwrap(), Some(ServiceStatus::StartPending));
        scm.start("svc").unwrap();
        assert_eq!(scm.status("svc").unwrap(), Some(ServiceStatus::Running));
    }

    #[test]
    fn test_deleted_registration_lingers() {
        let scm = MemoryScm::new().with_linger(2);
        scm.create(&spec("svc")).unwrap();
        scm.delete("svc").unwrap();

        assert!(matches!(scm.create(&spec("svc")), Err(ScmError::MarkedForDelete(_))));
        assert!(scm.status("svc").unwrap().is_some());
        assert!(scm.status("svc").unwrap().is_some());
        assert_eq!(scm.status("svc").unwrap(), None);
        assert!(scm.create(&spec("svc")).is_ok());
    }
}
