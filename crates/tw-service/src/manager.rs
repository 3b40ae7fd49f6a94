//! Manager Service
//!
//! The privileged side of the control protocol. Owns the tunnel state
//! table, the config store and the lifecycle of tunnel worker services,
//! and tells every event subscriber when anything changes.
//!
//! # Usage
//!
//! ```rust,ignore
//! let host = ServiceHost::new();
//! let manager = Arc::new(ManagerService::new(store, lifecycle, broadcaster, host.controller()));
//! let server = IpcServer::bind(settings.socket_paths())?;
//! host.run(MANAGER_SERVICE_NAME, ManagerLoop::new(server, manager))?;
//! ```
//!
//! Starting a tunnel installs its worker service; stopping uninstalls it.

use crate::error::ServiceError;
use crate::host::{Control, ControlLoop};
use crate::lifecycle::{tunnel_service_name, ServiceLifecycle};
use crate::scm::{ScmError, ServiceStatus};
use crate::state::{Operation, StateError, Step, TunnelTable};
use crate::store::{ConfigStore, StoreError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tw_ipc::{
    Broadcaster, CallHandler, ErrorKind, IpcServer, Notification, RemoteError, Reply, Request,
    TunnelState,
};
use tw_net::{TunnelConfig, TunnelName};

/// Grace period for event forwarders once the server has stopped
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Manager call errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("No tunnel named {0}")]
    NotFound(String),

    #[error("Tunnel {0} is not running")]
    NotRunning(String),

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::NotFound(_) | ManagerError::NotRunning(_) => ErrorKind::NotFound,
            ManagerError::ShuttingDown => ErrorKind::ShuttingDown,
            ManagerError::State(StateError::Busy { .. } | StateError::Unresolved(_)) => {
                ErrorKind::Busy
            }
            ManagerError::Store(e) => match e {
                StoreError::NotFound(_) => ErrorKind::NotFound,
                StoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                StoreError::Config(_) | StoreError::Parse { .. } => ErrorKind::InvalidArgument,
                StoreError::Io { .. } | StoreError::Serialize(_) => ErrorKind::Internal,
            },
            ManagerError::Service(e) => match e {
                ServiceError::AlreadyRunning(_) => ErrorKind::AlreadyExists,
                ServiceError::Scm(ScmError::NotFound(_)) => ErrorKind::NotFound,
                ServiceError::Config(_) => ErrorKind::InvalidArgument,
                _ => ErrorKind::Internal,
            },
        }
    }
}

impl From<ManagerError> for RemoteError {
    fn from(e: ManagerError) -> Self {
        RemoteError::new(e.kind(), e.to_string())
    }
}

/// Executes control-protocol calls
pub struct ManagerService {
    store: ConfigStore,
    lifecycle: Arc<ServiceLifecycle>,
    table: TunnelTable,
    events: Arc<Broadcaster>,
    quitting: AtomicBool,
    controller: Sender<Control>,
}

fn state_of(status: Option<ServiceStatus>) -> TunnelState {
    match status {
        Some(ServiceStatus::Running) => TunnelState::Started,
        Some(ServiceStatus::StartPending) => TunnelState::Starting,
        Some(ServiceStatus::StopPending) => TunnelState::Stopping,
        Some(ServiceStatus::Stopped) | None => TunnelState::Stopped,
    }
}

impl ManagerService {
    pub fn new(
        store: ConfigStore,
        lifecycle: Arc<ServiceLifecycle>,
        events: Arc<Broadcaster>,
        controller: Sender<Control>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            table: TunnelTable::new(),
            events,
            quitting: AtomicBool::new(false),
            controller,
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ManagerError> {
        if self.is_quitting() {
            return Err(ManagerError::ShuttingDown);
        }
        Ok(())
    }

    fn changed(&self, name: &TunnelName) {
        self.events.emit(&Notification::tunnel_changed(name));
    }

    /// Ask the service manager for the worker's state
    fn query(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        let status = self.lifecycle.status(&tunnel_service_name(name))?;
        Ok(state_of(status))
    }

    /// Current state, refreshed from the service manager
    ///
    /// A transition in flight is reported as it stands. Otherwise the
    /// worker's registration decides, so a worker that died is seen as
    /// stopped. A worker caught mid-transition is reported but not
    /// recorded, so the next call asks again.
    fn resolve(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        let seen = self.table.read(name);
        let known = seen.state();
        if known.is_transitional() {
            return Ok(known);
        }

        let observed = match self.query(name) {
            Ok(observed) => observed,
            Err(e) if known != TunnelState::Unknown => {
                warn!("Unable to refresh {}, keeping {}: {}", name, known, e);
                return Ok(known);
            }
            Err(e) => return Err(e),
        };

        let state = self.table.observe(name, seen, observed);
        if state == observed && state != known && !state.is_transitional() {
            if known == TunnelState::Unknown {
                debug!("Resolved {} as {}", name, state);
            } else {
                warn!("Tunnel {} is {} at the service manager, was {}", name, state, known);
                self.changed(name);
            }
        }
        Ok(state)
    }

    /// Refresh, then enter a transition
    ///
    /// A worker the service manager reports mid-transition is left alone.
    fn begin(&self, name: &TunnelName, op: Operation) -> Result<Step, ManagerError> {
        let current = self.resolve(name)?;
        if current.is_transitional() {
            return Err(StateError::Busy {
                name: name.to_string(),
                op,
                state: current,
            }
            .into());
        }
        Ok(self.table.begin(name, op)?)
    }

    /// Put a tunnel back after a failed transition
    fn recover(&self, name: &TunnelName, fallback: TunnelState) {
        let state = match self.query(name) {
            Ok(state) if !state.is_transitional() => state,
            Ok(_) => TunnelState::Unknown,
            Err(e) => {
                warn!("Unable to query {} after failure: {}", name, e);
                fallback
            }
        };
        self.table.finish(name, state, None);
        self.changed(name);
    }

    pub fn start(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        self.ensure_running()?;
        let config = self.store.load(name)?;

        match self.begin(name, Operation::Start)? {
            Step::Already(state) => return Ok(state),
            Step::Begin(_) => {
                info!("Starting tunnel {}", name);
                self.changed(name);
            }
        }

        match self.lifecycle.install_tunnel(&self.store.path_for(name)) {
            Ok(()) => {
                self.table.finish(name, TunnelState::Started, Some(config));
                self.changed(name);
                Ok(TunnelState::Started)
            }
            Err(e) => {
                error!("Failed to start tunnel {}: {}", name, e);
                self.recover(name, TunnelState::Stopped);
                Err(e.into())
            }
        }
    }

    pub fn stop(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        match self.begin(name, Operation::Stop)? {
            Step::Already(state) => return Ok(state),
            Step::Begin(_) => {
                info!("Stopping tunnel {}", name);
                self.changed(name);
            }
        }

        match self.lifecycle.uninstall_tunnel(name) {
            Ok(()) | Err(ServiceError::Scm(ScmError::NotFound(_))) => {
                self.table.finish(name, TunnelState::Stopped, None);
                self.changed(name);
                Ok(TunnelState::Stopped)
            }
            Err(e) => {
                error!("Failed to stop tunnel {}: {}", name, e);
                self.recover(name, TunnelState::Started);
                Err(e.into())
            }
        }
    }

    /// Stop if needed, then forget the tunnel and its stored config
    ///
    /// Returns `Deleting`; the tunnel is gone once the reply arrives.
    pub fn delete(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        if !self.store.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        if let Step::Begin(_) = self.begin(name, Operation::Delete)? {
            info!("Deleting tunnel {}", name);
            self.changed(name);
        }

        match self.lifecycle.uninstall_tunnel(name) {
            Ok(()) | Err(ServiceError::Scm(ScmError::NotFound(_))) => {}
            Err(e) => {
                error!("Failed to stop tunnel {} for deletion: {}", name, e);
                self.recover(name, TunnelState::Started);
                return Err(e.into());
            }
        }

        if let Err(e) = self.store.delete(name) {
            error!("Failed to remove config of {}: {}", name, e);
            self.table.finish(name, TunnelState::Stopped, None);
            self.changed(name);
            return Err(e.into());
        }

        self.table.remove(name);
        self.changed(name);
        self.events.emit(&Notification::TunnelsChanged);
        Ok(TunnelState::Deleting)
    }

    pub fn state(&self, name: &TunnelName) -> Result<TunnelState, ManagerError> {
        if self.table.get(name) == TunnelState::Unknown && !self.store.exists(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        self.resolve(name)
    }

    pub fn stored_config(&self, name: &TunnelName) -> Result<TunnelConfig, ManagerError> {
        Ok(self.store.load(name)?)
    }

    /// Configuration the running tunnel was started from
    pub fn runtime_config(&self, name: &TunnelName) -> Result<TunnelConfig, ManagerError> {
        if let Some(config) = self.table.runtime_config(name) {
            return Ok(config);
        }
        // Started by an earlier manager, before we took a snapshot
        match self.resolve(name)? {
            TunnelState::Started => self.stored_config(name),
            _ => Err(ManagerError::NotRunning(name.to_string())),
        }
    }

    pub fn create(&self, config: TunnelConfig) -> Result<TunnelName, ManagerError> {
        self.ensure_running()?;
        self.store.create(&config)?;
        let name = config.name;
        self.table.finish(&name, TunnelState::Stopped, None);
        self.events.emit(&Notification::TunnelsChanged);
        Ok(name)
    }

    pub fn tunnels(&self) -> Result<Vec<TunnelName>, ManagerError> {
        Ok(self.store.list()?)
    }

    /// Begin shutting down; returns whether a quit was already under way
    pub fn quit(&self, stop_tunnels: bool) -> bool {
        if self.quitting.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!("Quit requested (stop tunnels: {})", stop_tunnels);
        if stop_tunnels {
            for name in self.table.in_state(TunnelState::Started) {
                if let Err(e) = self.stop(&name) {
                    warn!("Failed to stop {} while quitting: {}", name, e);
                }
            }
        }
        if self.controller.send(Control::Stop).is_err() {
            warn!("Manager control loop already gone");
        }
        false
    }
}

impl CallHandler for ManagerService {
    fn handle(&self, request: Request) -> Result<Reply, RemoteError> {
        debug!("Call {}", request.method());
        let reply = match request {
            Request::StoredConfig { name } => self.stored_config(&name).map(Reply::Config),
            Request::RuntimeConfig { name } => self.runtime_config(&name).map(Reply::Config),
            Request::Start { name } => self.start(&name).map(Reply::State),
            Request::Stop { name } => self.stop(&name).map(Reply::State),
            Request::Delete { name } => self.delete(&name).map(Reply::State),
            Request::State { name } => self.state(&name).map(Reply::State),
            Request::Create { config } => self.create(config).map(Reply::Created),
            Request::Tunnels => self.tunnels().map(Reply::Tunnels),
            Request::Quit { stop_tunnels } => Ok(Reply::Quit {
                already_quitting: self.quit(stop_tunnels),
            }),
        };
        reply.map_err(RemoteError::from)
    }
}

/// Manager role: serves IPC until told to stop
pub struct ManagerLoop {
    server: IpcServer,
    service: Arc<ManagerService>,
}

impl ManagerLoop {
    pub fn new(server: IpcServer, service: Arc<ManagerService>) -> Self {
        Self { server, service }
    }
}

impl ControlLoop for ManagerLoop {
    /// Serve on a private runtime until a stop arrives
    ///
    /// Returns only after every call connection has sent its last reply,
    /// so the reply to a quit request is on the wire before the process
    /// exits.
    fn run(self, controls: Receiver<Control>) -> Result<(), ServiceError> {
        let ManagerLoop { server, service } = self;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tw-ipc")
            .build()?;

        let shutdown = server.shutdown_handle();
        let events = Arc::clone(&service.events);
        let handler: Arc<dyn CallHandler> = service;
        let serving = runtime.spawn(server.run(handler, events));

        // A dropped controller also ends the loop
        let _ = controls.recv();
        info!("Shutting down manager");
        shutdown.shutdown();

        let result = runtime.block_on(serving);
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        match result {
            Ok(result) => Ok(result?),
            Err(e) => {
                error!("IPC server task failed: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_scm::{MemoryConnector, MemoryScm};
    use crate::scm::{CachedConnection, ServiceControlManager};
    use std::path::PathBuf;
    use std::thread;
    use std::time::Instant;
    use tokio::sync::broadcast;
    use tw_ipc::{ManagerClient, SocketPaths};
    use tw_net::{PeerConfig, PrivateKey};

    const OFFICE_SERVICE: &str = "Tunwarden Tunnel: office";

    struct Fixture {
        manager: ManagerService,
        scm: Arc<MemoryScm>,
        events: broadcast::Receiver<Notification>,
        controls: Receiver<Control>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        /// Notifications emitted since the last call
        fn events(&mut self) -> Vec<Notification> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn fixture_with(linger: u32, poll_interval: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scm = Arc::new(MemoryScm::new().with_linger(linger));
        let lifecycle = Arc::new(ServiceLifecycle::new(
            Arc::new(CachedConnection::new(MemoryConnector(Arc::clone(&scm)))),
            PathBuf::from("/usr/bin/tunwarden"),
            poll_interval,
        ));
        let broadcaster = Arc::new(Broadcaster::new());
        let events = broadcaster.subscribe();
        let (tx, controls) = crossbeam_channel::unbounded();
        let manager = ManagerService::new(
            ConfigStore::new(dir.path()),
            lifecycle,
            broadcaster,
            tx,
        );
        Fixture {
            manager,
            scm,
            events,
            controls,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(1, Duration::ZERO)
    }

    fn name(s: &str) -> TunnelName {
        TunnelName::new(s).unwrap()
    }

    fn config(s: &str) -> TunnelConfig {
        let mut config = TunnelConfig::new(name(s));
        config.interface.private_key = Some(PrivateKey::from_bytes([5u8; 32]));
        config.interface.addresses = vec!["10.0.0.2/24".parse().unwrap()];
        config.peers.push(
            PeerConfig::new(PrivateKey::from_bytes([6u8; 32]).public_key())
                .allow("10.0.0.0/24".parse().unwrap()),
        );
        config
    }

    #[test]
    fn test_create_then_start_and_stop() {
        let mut f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Stopped);

        assert_eq!(f.manager.start(&office).unwrap(), TunnelState::Started);
        assert_eq!(
            f.scm.status(OFFICE_SERVICE).unwrap(),
            Some(ServiceStatus::Running)
        );
        assert_eq!(f.manager.runtime_config(&office).unwrap(), config("office"));

        assert_eq!(f.manager.stop(&office).unwrap(), TunnelState::Stopped);
        assert!(matches!(
            f.manager.runtime_config(&office),
            Err(ManagerError::NotRunning(_))
        ));

        let changed = Notification::tunnel_changed(&office);
        assert_eq!(
            f.events(),
            vec![
                Notification::TunnelsChanged,
                changed.clone(),
                changed.clone(),
                changed.clone(),
                changed,
            ]
        );
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.start(&office).unwrap();
        assert_eq!(f.manager.start(&office).unwrap(), TunnelState::Started);
        assert_eq!(f.scm.creates(), 1);

        f.manager.stop(&office).unwrap();
        assert_eq!(f.manager.stop(&office).unwrap(), TunnelState::Stopped);
    }

    #[test]
    fn test_failed_start_leaves_stopped() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.scm.fail_next_create(ScmError::Backend("denied".into()));

        let err = f.manager.start(&office).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Stopped);
    }

    #[test]
    fn test_failed_start_records_what_the_service_manager_sees() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.scm.fail_next_start(ScmError::Backend("timed out".into()));

        assert_eq!(f.manager.start(&office).unwrap_err().kind(), ErrorKind::Internal);
        // Still starting at the service manager, so not recorded as stopped
        assert_eq!(f.manager.table.get(&office), TunnelState::Unknown);
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Starting);
        assert_eq!(f.manager.stop(&office).unwrap_err().kind(), ErrorKind::Busy);

        f.scm.set_status(OFFICE_SERVICE, ServiceStatus::Running);
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Started);
        assert_eq!(f.manager.stop(&office).unwrap(), TunnelState::Stopped);
    }

    #[test]
    fn test_worker_starting_elsewhere_is_busy() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.lifecycle.install_tunnel(&f.manager.store.path_for(&office)).unwrap();
        f.scm.set_status(OFFICE_SERVICE, ServiceStatus::StartPending);

        assert_eq!(f.manager.start(&office).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(f.manager.stop(&office).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(f.manager.delete(&office).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(f.scm.creates(), 1);
        assert!(f.manager.store.exists(&office));
    }

    #[test]
    fn test_dead_worker_seen_as_stopped_and_restarted() {
        let mut f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.start(&office).unwrap();
        f.events();

        // The worker exits on its own, e.g. after a fatal configure error
        f.scm.set_status(OFFICE_SERVICE, ServiceStatus::Stopped);
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Stopped);
        assert_eq!(f.events(), vec![Notification::tunnel_changed(&office)]);
        assert!(matches!(
            f.manager.runtime_config(&office),
            Err(ManagerError::NotRunning(_))
        ));

        assert_eq!(f.manager.start(&office).unwrap(), TunnelState::Started);
        assert_eq!(f.scm.creates(), 2);
        assert_eq!(
            f.scm.status(OFFICE_SERVICE).unwrap(),
            Some(ServiceStatus::Running)
        );
    }

    #[test]
    fn test_refresh_failure_keeps_known_state() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.start(&office).unwrap();

        f.scm.fail_next(ScmError::Backend("unavailable".into()));
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Started);
    }

    #[test]
    fn test_delete_while_starting_is_busy() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.table.begin(&office, Operation::Start).unwrap();

        let err = f.manager.delete(&office).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(f.manager.store.exists(&office));
    }

    #[test]
    fn test_conflicting_requests_from_two_threads() {
        // Each purge poll takes 10ms, holding the start open for a while
        let f = fixture_with(40, Duration::from_millis(10));
        let office = f.manager.create(config("office")).unwrap();
        // Stale stopped registration left behind by an earlier worker
        f.manager.lifecycle.install_tunnel(&f.manager.store.path_for(&office)).unwrap();
        f.scm.set_status(OFFICE_SERVICE, ServiceStatus::Stopped);

        let manager = Arc::new(f.manager);
        let starting = {
            let manager = Arc::clone(&manager);
            let office = office.clone();
            thread::spawn(move || manager.start(&office))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.table.get(&office) != TunnelState::Starting {
            assert!(Instant::now() < deadline, "start never began");
            thread::sleep(Duration::from_millis(1));
        }

        let deleting = {
            let manager = Arc::clone(&manager);
            let office = office.clone();
            thread::spawn(move || manager.delete(&office))
        };
        let err = deleting.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(manager.stop(&office).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(manager.state(&office).unwrap(), TunnelState::Starting);

        assert_eq!(starting.join().unwrap().unwrap(), TunnelState::Started);
        assert!(manager.store.exists(&office));
        assert_eq!(f.scm.creates(), 2);
    }

    #[test]
    fn test_delete_running_tunnel() {
        let mut f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.start(&office).unwrap();

        assert_eq!(f.manager.delete(&office).unwrap(), TunnelState::Deleting);
        assert!(f.scm.is_empty());
        assert!(f.manager.tunnels().unwrap().is_empty());
        assert_eq!(
            f.manager.state(&office).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(f.events().last(), Some(&Notification::TunnelsChanged));
    }

    #[test]
    fn test_unknown_state_resolved_from_service_manager() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        // Forget what create recorded, as after a manager restart
        f.manager.table.remove(&office);
        f.manager.lifecycle.install_tunnel(&f.manager.store.path_for(&office)).unwrap();

        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Started);
        assert_eq!(f.manager.runtime_config(&office).unwrap(), config("office"));
    }

    #[test]
    fn test_create_duplicate_and_invalid() {
        let f = fixture();
        f.manager.create(config("office")).unwrap();
        let dup = f.manager.create(config("office")).unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::AlreadyExists);

        let mut bad = config("bad");
        bad.interface.mtu = 100;
        assert_eq!(
            f.manager.create(bad).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_quit_once() {
        let f = fixture();
        let office = f.manager.create(config("office")).unwrap();
        f.manager.start(&office).unwrap();

        assert!(!f.manager.quit(true));
        assert_eq!(f.controls.try_recv().unwrap(), Control::Stop);
        assert_eq!(f.manager.state(&office).unwrap(), TunnelState::Stopped);

        assert!(f.manager.quit(false));
        assert!(f.controls.try_recv().is_err());
        assert_eq!(
            f.manager.start(&office).unwrap_err().kind(),
            ErrorKind::ShuttingDown
        );
    }

    #[test]
    fn test_handler_maps_requests() {
        let f = fixture();
        let reply = f
            .manager
            .handle(Request::Create {
                config: config("office"),
            })
            .unwrap();
        assert_eq!(reply, Reply::Created(name("office")));
        assert_eq!(
            f.manager.handle(Request::Tunnels).unwrap(),
            Reply::Tunnels(vec![name("office")])
        );
        let err = f
            .manager
            .handle(Request::StoredConfig { name: name("home") })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_manager_loop_stops_on_control() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let server = IpcServer::bind(SocketPaths::in_dir(dir.path())).unwrap();
        let paths = server.paths().clone();
        let (tx, rx) = crossbeam_channel::unbounded();

        let running = thread::spawn(move || ManagerLoop::new(server, Arc::new(f.manager)).run(rx));
        tx.send(Control::Stop).unwrap();
        running.join().unwrap().unwrap();
        assert!(!paths.call.exists());
    }

    #[test]
    fn test_quit_reply_reaches_client_before_exit() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let server = IpcServer::bind(SocketPaths::in_dir(dir.path())).unwrap();
        let paths = server.paths().clone();
        let Fixture {
            manager,
            controls,
            _dir,
            ..
        } = f;
        let running = thread::spawn(move || ManagerLoop::new(server, Arc::new(manager)).run(controls));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let already_quitting = runtime.block_on(async {
            let client = ManagerClient::connect(&paths).await.unwrap();
            client.quit(false).await
        });

        assert!(!already_quitting.unwrap());
        running.join().unwrap().unwrap();
        assert!(!paths.call.exists());
    }
}
