//! IPC errors.

use crate::codec::MAX_FRAME_SIZE;
use crate::message::RemoteError;
use std::io;

/// Errors surfaced at a call site
///
/// Everything except [`IpcError::Remote`] is a transport failure: the
/// request may or may not have reached the manager.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Connection closed")]
    Closed,

    #[error("Reply id {got} does not match request id {expected}")]
    Mismatch { expected: u64, got: u64 },

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl IpcError {
    /// The failure happened on the channel, not in the manager
    pub fn is_transport(&self) -> bool {
        !matches!(self, IpcError::Remote(_))
    }

    /// Remote failure details, if the manager rejected the call
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            IpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(e: serde_json::Error) -> Self {
        IpcError::Decode(e.to_string())
    }
}
