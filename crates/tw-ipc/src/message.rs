//! Wire messages for the call and event channels.

use serde::{Deserialize, Serialize};
use std::fmt;
use tw_net::{TunnelConfig, TunnelName};

/// Lifecycle state of a managed tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Not queried yet
    #[default]
    Unknown,
    Started,
    Stopped,
    Starting,
    Stopping,
    Deleting,
}

impl TunnelState {
    /// A transition is in progress
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            TunnelState::Starting | TunnelState::Stopping | TunnelState::Deleting
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Unknown => "unknown",
            TunnelState::Started => "started",
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Stopping => "stopping",
            TunnelState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Asynchronous notification pushed by the manager
///
/// The tunnel name travels as a raw string: the listener validates it and
/// drops events that do not carry a usable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "tunnel", rename_all = "snake_case")]
pub enum Notification {
    TunnelChanged(String),
    TunnelsChanged,
}

impl Notification {
    pub fn tunnel_changed(name: &TunnelName) -> Self {
        Notification::TunnelChanged(name.to_string())
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::TunnelChanged(_) => NotificationKind::TunnelChanged,
            Notification::TunnelsChanged => NotificationKind::TunnelsChanged,
        }
    }
}

/// Event kinds subscribers register against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    TunnelChanged,
    TunnelsChanged,
}

/// Call-channel request, addressed by method name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    StoredConfig { name: TunnelName },
    RuntimeConfig { name: TunnelName },
    Start { name: TunnelName },
    Stop { name: TunnelName },
    Delete { name: TunnelName },
    State { name: TunnelName },
    Create { config: TunnelConfig },
    Tunnels,
    Quit { stop_tunnels: bool },
}

impl Request {
    /// Method name as it appears on the wire
    pub fn method(&self) -> &'static str {
        match self {
            Request::StoredConfig { .. } => "stored_config",
            Request::RuntimeConfig { .. } => "runtime_config",
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
            Request::Delete { .. } => "delete",
            Request::State { .. } => "state",
            Request::Create { .. } => "create",
            Request::Tunnels => "tunnels",
            Request::Quit { .. } => "quit",
        }
    }
}

/// Successful call result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Config(TunnelConfig),
    State(TunnelState),
    Tunnels(Vec<TunnelName>),
    Created(TunnelName),
    Quit { already_quitting: bool },
}

/// Category of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No such tunnel
    NotFound,
    /// Tunnel or service registration already exists / runs
    AlreadyExists,
    /// A conflicting transition is in progress
    Busy,
    /// Malformed argument
    InvalidArgument,
    /// Manager is shutting down
    ShuttingDown,
    /// Anything else
    Internal,
}

/// Error raised by the manager while executing a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Request frame with the id its reply echoes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    pub request: Request,
}

/// Reply frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub result: Result<Reply, RemoteError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_defaults_to_unknown() {
        assert_eq!(TunnelState::default(), TunnelState::Unknown);
        assert!(TunnelState::Starting.is_transitional());
        assert!(!TunnelState::Stopped.is_transitional());
    }

    #[test]
    fn test_request_wire_shape() {
        let request = Request::Start {
            name: TunnelName::new("office").unwrap(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "start");
        assert_eq!(json["params"]["name"], "office");
        assert_eq!(request.method(), "start");
    }

    #[test]
    fn test_request_rejects_invalid_name() {
        let json = r#"{"method":"state","params":{"name":"bad name!"}}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn test_notification_wire_shape() {
        let json = serde_json::to_string(&Notification::TunnelsChanged).unwrap();
        assert_eq!(json, r#"{"event":"tunnels_changed"}"#);

        let changed: Notification =
            serde_json::from_str(r#"{"event":"tunnel_changed","tunnel":"office"}"#).unwrap();
        assert_eq!(changed, Notification::TunnelChanged("office".into()));
        assert_eq!(changed.kind(), NotificationKind::TunnelChanged);
    }

    #[test]
    fn test_reply_frame_carries_remote_error() {
        let frame = ReplyFrame {
            id: 7,
            result: Err(RemoteError::new(ErrorKind::Busy, "office is starting")),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ReplyFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
