//! Error types for meshwire

use crate::types::ProtocolId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(ProtocolId),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Record decode error: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Packaging error: {0}")]
    Packaging(String),
}

/// Broad failure class, used by callers to decide between retrying with a
/// different address, retrying the same address, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The destination could not be turned into a routable peer id
    Resolution,
    /// A stream could not be opened, or failed mid-exchange
    Transport,
    /// Received bytes did not match the protocol's framing
    Framing,
    /// Packing or unpacking a snapshot failed
    Packaging,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidAddress(_) | Error::InvalidPeerId(_) => ErrorKind::Resolution,
            Error::Io(_) | Error::ConnectionFailed(_) | Error::ProtocolNotSupported(_) => {
                ErrorKind::Transport
            }
            Error::Framing(_) | Error::Record(_) => ErrorKind::Framing,
            Error::Packaging(_) => ErrorKind::Packaging,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
