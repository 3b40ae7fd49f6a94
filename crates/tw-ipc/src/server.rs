//! Manager-side endpoints
//!
//! The call channel and the event channel are two separate Unix sockets.
//! Each call connection is served on its own task and each request runs on
//! the blocking pool; every event connection becomes a subscriber of the
//! [`Broadcaster`].

use crate::codec::{read_frame, write_frame};
use crate::error::IpcError;
use crate::message::{CallFrame, ErrorKind, Notification, RemoteError, Reply, ReplyFrame, Request};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// File name of the call socket
pub const CALL_SOCKET: &str = "call.sock";

/// File name of the event socket
pub const EVENTS_SOCKET: &str = "events.sock";

/// Subscribers that stall longer than this are dropped
const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Notifications a subscriber may fall behind before it is dropped
pub const EVENT_BACKLOG: usize = 256;

/// Locations of the two manager sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    pub call: PathBuf,
    pub events: PathBuf,
}

impl SocketPaths {
    /// Standard socket names inside a runtime directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            call: dir.join(CALL_SOCKET),
            events: dir.join(EVENTS_SOCKET),
        }
    }
}

/// Executes decoded requests
///
/// Handlers block on the service manager, so they are always invoked on
/// the blocking pool.
pub trait CallHandler: Send + Sync {
    fn handle(&self, request: Request) -> Result<Reply, RemoteError>;
}

fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(panic_info) => {
            if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}

/// Resolves once shutdown has been requested or the server is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve calls on one connection until the client hangs up or the server
/// shuts down
///
/// Shutdown is only honoured between requests: a call that has been read
/// always gets its reply. A panic inside the handler is reported to the
/// caller as an internal error and does not take the connection down.
pub async fn serve_calls<S>(
    mut stream: S,
    handler: Arc<dyn CallHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => {
                debug!("Closing call connection for shutdown");
                return Ok(());
            }
            frame = read_frame::<_, CallFrame>(&mut stream) => frame?,
        };
        let Some(CallFrame { id, request }) = frame else {
            debug!("Call client disconnected");
            return Ok(());
        };

        let method = request.method();
        debug!("Handling {} (id {})", method, id);
        let worker = Arc::clone(&handler);
        let result = match tokio::task::spawn_blocking(move || worker.handle(request)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Handler for {} panicked: {}", method, panic_message(e));
                Err(RemoteError::new(ErrorKind::Internal, format!("{} panicked", method)))
            }
        };

        if let Err(e) = &result {
            debug!("{} failed: {}", method, e);
        }
        write_frame(&mut stream, &ReplyFrame { id, result }).await?;
    }
}

/// Fans notifications out to every event subscriber
///
/// Each subscriber gets the notifications in emission order. A subscriber
/// whose writes fail, stall or fall [`EVENT_BACKLOG`] notifications behind
/// is dropped; emitting never waits on a subscriber.
pub struct Broadcaster {
    tx: broadcast::Sender<Notification>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BACKLOG);
        Self { tx }
    }

    /// Receive every notification emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Forward notifications to an event connection
    ///
    /// Must be called from within a tokio runtime. The returned task ends
    /// when the subscriber is dropped.
    pub fn attach<W>(&self, sink: W) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(forward_events(sink, self.subscribe()))
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue one notification for every subscriber; returns how many
    pub fn emit(&self, notification: &Notification) -> usize {
        self.tx.send(notification.clone()).unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward_events<W>(mut sink: W, mut events: broadcast::Receiver<Notification>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let notification = match events.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Dropping event subscriber {} notifications behind", missed);
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match tokio::time::timeout(SINK_WRITE_TIMEOUT, write_frame(&mut sink, &notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Dropping event subscriber: {}", e);
                return;
            }
            Err(_) => {
                debug!("Dropping stalled event subscriber");
                return;
            }
        }
    }
}

/// Stops a running [`IpcServer`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Bound call and event sockets
pub struct IpcServer {
    paths: SocketPaths,
    calls: StdUnixListener,
    events: StdUnixListener,
    shutdown: Arc<watch::Sender<bool>>,
}

fn bind_socket(path: &Path) -> Result<StdUnixListener, IpcError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = StdUnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    Ok(listener)
}

impl IpcServer {
    /// Bind both sockets, replacing stale socket files
    ///
    /// Binding needs no runtime, so bind failures surface before the
    /// service starts; connections are accepted once [`IpcServer::run`]
    /// is polled.
    pub fn bind(paths: SocketPaths) -> Result<Self, IpcError> {
        let calls = bind_socket(&paths.call)?;
        let events = bind_socket(&paths.events)?;
        info!(
            "IPC listening on {} and {}",
            paths.call.display(),
            paths.events.display()
        );
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            paths,
            calls,
            events,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn paths(&self) -> &SocketPaths {
        &self.paths
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Accept connections until shut down, then wait for every call
    /// connection to deliver its last reply
    pub async fn run(
        self,
        handler: Arc<dyn CallHandler>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<(), IpcError> {
        let IpcServer {
            paths,
            calls,
            events,
            shutdown,
        } = self;
        let calls = UnixListener::from_std(calls)?;
        let events = UnixListener::from_std(events)?;

        let mut stop = shutdown.subscribe();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                result = calls.accept() => match result {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&handler);
                        let shutdown = shutdown.subscribe();
                        connections.spawn(async move {
                            if let Err(e) = serve_calls(stream, handler, shutdown).await {
                                debug!("IPC connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("IPC accept error: {}", e),
                },
                result = events.accept() => match result {
                    Ok((stream, _addr)) => {
                        debug!("Event subscriber connected");
                        broadcaster.attach(stream);
                    }
                    Err(e) => error!("IPC accept error: {}", e),
                },
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        error!("Call connection task failed: {}", e);
                    }
                }
            }
        }

        drop(calls);
        drop(events);
        while let Some(done) = connections.join_next().await {
            if let Err(e) = done {
                error!("Call connection task failed: {}", e);
            }
        }
        for path in [&paths.call, &paths.events] {
            let _ = fs::remove_file(path);
        }
        info!("IPC server stopped");
        Ok(())
    }
}
