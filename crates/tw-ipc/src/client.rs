//! Manager client
//!
//! Holds the call transport and the subscriber registries for one
//! connection to the manager. The event stream is read by a separate
//! listener task so notifications flow while calls are outstanding.

use crate::codec::{read_frame, write_frame};
use crate::error::IpcError;
use crate::message::{CallFrame, Notification, Reply, ReplyFrame, Request, TunnelState};
use crate::server::SocketPaths;
use crate::subscribers::Subscribers;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tw_net::{TunnelConfig, TunnelName};

struct CallTransport<S> {
    stream: S,
    next_id: u64,
}

/// Client side of the call channel
pub struct ManagerClient<S> {
    transport: Mutex<CallTransport<S>>,
    subscribers: Arc<Subscribers>,
}

impl ManagerClient<UnixStream> {
    /// Connect both channels and start the event listener
    pub async fn connect(paths: &SocketPaths) -> Result<Self, IpcError> {
        let calls = UnixStream::connect(&paths.call).await?;
        let events = UnixStream::connect(&paths.events).await?;
        let client = Self::new(calls);
        spawn_listener(events, client.subscribers());
        Ok(client)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ManagerClient<S> {
    /// Wrap an already connected call stream
    pub fn new(stream: S) -> Self {
        Self {
            transport: Mutex::new(CallTransport { stream, next_id: 1 }),
            subscribers: Arc::new(Subscribers::new()),
        }
    }

    /// Registries notifications are dispatched to
    pub fn subscribers(&self) -> Arc<Subscribers> {
        Arc::clone(&self.subscribers)
    }

    /// Issue one call and wait for its reply
    ///
    /// Calls on one client are serialized; there is never more than one
    /// request in flight on the transport. A caller that gives up on a call
    /// leaves its reply on the wire, and the next call skips it.
    pub async fn call(&self, request: Request) -> Result<Reply, IpcError> {
        let mut transport = self.transport.lock().await;
        let id = transport.next_id;
        transport.next_id += 1;

        debug!("Calling {} (id {})", request.method(), id);
        write_frame(&mut transport.stream, &CallFrame { id, request }).await?;

        loop {
            let reply: ReplyFrame = read_frame(&mut transport.stream)
                .await?
                .ok_or(IpcError::Closed)?;
            if reply.id < id {
                debug!("Discarding reply to abandoned call {}", reply.id);
                continue;
            }
            if reply.id != id {
                return Err(IpcError::Mismatch {
                    expected: id,
                    got: reply.id,
                });
            }
            return Ok(reply.result?);
        }
    }

    pub async fn stored_config(&self, name: &TunnelName) -> Result<TunnelConfig, IpcError> {
        match self.call(Request::StoredConfig { name: name.clone() }).await? {
            Reply::Config(config) => Ok(config),
            _ => Err(IpcError::UnexpectedReply("stored_config")),
        }
    }

    pub async fn runtime_config(&self, name: &TunnelName) -> Result<TunnelConfig, IpcError> {
        match self.call(Request::RuntimeConfig { name: name.clone() }).await? {
            Reply::Config(config) => Ok(config),
            _ => Err(IpcError::UnexpectedReply("runtime_config")),
        }
    }

    pub async fn start(&self, name: &TunnelName) -> Result<TunnelState, IpcError> {
        self.state_call(Request::Start { name: name.clone() }).await
    }

    pub async fn stop(&self, name: &TunnelName) -> Result<TunnelState, IpcError> {
        self.state_call(Request::Stop { name: name.clone() }).await
    }

    pub async fn delete(&self, name: &TunnelName) -> Result<TunnelState, IpcError> {
        self.state_call(Request::Delete { name: name.clone() }).await
    }

    pub async fn state(&self, name: &TunnelName) -> Result<TunnelState, IpcError> {
        self.state_call(Request::State { name: name.clone() }).await
    }

    async fn state_call(&self, request: Request) -> Result<TunnelState, IpcError> {
        let method = request.method();
        match self.call(request).await? {
            Reply::State(state) => Ok(state),
            _ => Err(IpcError::UnexpectedReply(method)),
        }
    }

    /// Store a new tunnel configuration
    pub async fn create(&self, config: TunnelConfig) -> Result<TunnelName, IpcError> {
        match self.call(Request::Create { config }).await? {
            Reply::Created(name) => Ok(name),
            _ => Err(IpcError::UnexpectedReply("create")),
        }
    }

    /// Names of all stored tunnels
    pub async fn tunnels(&self) -> Result<Vec<TunnelName>, IpcError> {
        match self.call(Request::Tunnels).await? {
            Reply::Tunnels(names) => Ok(names),
            _ => Err(IpcError::UnexpectedReply("tunnels")),
        }
    }

    /// Ask the manager to exit; true if it was already quitting
    pub async fn quit(&self, stop_tunnels: bool) -> Result<bool, IpcError> {
        match self.call(Request::Quit { stop_tunnels }).await? {
            Reply::Quit { already_quitting } => Ok(already_quitting),
            _ => Err(IpcError::UnexpectedReply("quit")),
        }
    }
}

/// Decode notifications until the stream ends, dispatching each in order
///
/// Stops without reporting on EOF or on the first malformed frame.
pub async fn listen<R: AsyncRead + Unpin>(mut events: R, subscribers: &Subscribers) {
    loop {
        match read_frame::<_, Notification>(&mut events).await {
            Ok(Some(notification)) => {
                subscribers.dispatch(&notification);
            }
            Ok(None) => {
                debug!("Event stream closed");
                return;
            }
            Err(e) => {
                debug!("Event stream ended: {}", e);
                return;
            }
        }
    }
}

/// Run [`listen`] on its own task
pub fn spawn_listener<R>(events: R, subscribers: Arc<Subscribers>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { listen(events, &subscribers).await })
}
