//! Error types surfaced by the link manager

use std::io;

use thiserror::Error;

use crate::fault::FaultClass;
use crate::protocol::FrameError;

/// Errors reported through [`LinkListener::on_error`](crate::listener::LinkListener::on_error)
/// and returned by the public API
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no USB serial driver matched device {0}")]
    NoDriver(String),
    #[error("driver reported no available serial ports for {0}")]
    NoPorts(String),
    #[error("permission denied for device {0}")]
    PermissionDenied(String),
    #[error("serial port not connected")]
    NotConnected,
    #[error("link manager has been shut down")]
    ShutDown,
    #[error("link fault ({class}): {source}")]
    Fault {
        class: FaultClass,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("packet error: {0}")]
    Frame(#[from] FrameError),
}

impl LinkError {
    /// Fault class, when the error came out of the fault classifier
    pub fn fault_class(&self) -> Option<FaultClass> {
        match self {
            LinkError::Fault { class, .. } => Some(*class),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

/// Result type alias for link operations
pub type LinkResult<T> = Result<T, LinkError>;
