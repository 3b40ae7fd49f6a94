//! tunwarden control protocol
//!
//! Two independent channels between an unprivileged client and the
//! privileged manager:
//!
//! - **call**: synchronous request/reply, one request in flight per client,
//!   every reply echoing its request id
//! - **events**: one-way stream of [`Notification`]s, read by a dedicated
//!   listener task and fanned out to per-kind [`Subscribers`]
//!
//! Both ends run on tokio; the manager's request handlers stay blocking
//! and run on the blocking pool.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded frame

mod client;
mod codec;
mod error;
mod message;
mod server;
mod subscribers;

pub use client::{listen, spawn_listener, ManagerClient};
pub use codec::{encode_frame, read_frame, write_frame, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use error::IpcError;
pub use message::{
    CallFrame, ErrorKind, Notification, NotificationKind, RemoteError, Reply, ReplyFrame, Request,
    TunnelState,
};
pub use server::{
    serve_calls, Broadcaster, CallHandler, IpcServer, ShutdownHandle, SocketPaths, CALL_SOCKET,
    EVENTS_SOCKET, EVENT_BACKLOG,
};
pub use subscribers::{Subscribers, Subscription};
