//! Smart protocol engines
//!
//! - [`advertise`]: reference advertisement for `info/refs`
//! - [`upload`]: want/have negotiation and pack streaming (fetch, clone)
//! - [`receive`]: reference update commands and pack intake (push)

use std::fmt;
use std::io;

use crate::packfile::PackError;
use crate::pktline::PktLineError;
use crate::store::StoreError;

pub mod advertise;
pub mod receive;
pub mod upload;

pub use advertise::{advertised_references, list_references};
pub use receive::{ReceiveReport, RefUpdateStatus, receive_pack};
pub use upload::{UploadRequest, upload_pack};

/// Capabilities announced by every advertisement
pub const CAPABILITIES: &str = "report-status delete-refs ofs-delta";

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the protocol engines
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("pkt-line error: {0}")]
    PktLine(#[from] PktLineError),

    #[error("protocol error: {0}")]
    Parse(String),

    /// The pushed pack could not be stored; already reported to the client
    #[error("unpack failed: {0}")]
    Unpack(#[source] PackError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the request itself was malformed
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::PktLine(_))
    }
}

/// The two smart services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch and clone
    UploadPack,
    /// Push
    ReceivePack,
}

impl Service {
    pub const ALL: [Service; 2] = [Service::UploadPack, Service::ReceivePack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|service| service.as_str() == name)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
