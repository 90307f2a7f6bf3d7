use std::path::PathBuf;

use thiserror::Error;

/// The crate-wide result alias. Every fallible operation on
/// [`crate::controller::VmDebugController`] returns this.
pub type Result<T> = std::result::Result<T, VmControllerError>;

/// Closed taxonomy of everything that can go wrong while driving a VM debug
/// session. Connection failures are folded into `ConnectionLost` rather than
/// bubbling raw I/O errors through every call site, matching the wire
/// protocol's own `ConnectionError` sentinel.
#[derive(Debug, Error)]
pub enum VmControllerError {
    #[error("connection to {description} was lost: {source}")]
    ConnectionLost {
        description: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: expected {expected}, found {found}")]
    ProtocolViolation { expected: String, found: String },

    #[error("handshake did not complete within the configured deadline")]
    HandshakeTimeout,

    #[error("snapshot hash mismatch: vm reported {found:#x}, info file says {expected:#x}")]
    SnapshotHashMismatch { expected: u64, found: u64 },

    #[error("info file not found at {0}")]
    InfoFileNotFound(PathBuf),

    #[error("malformed info file: {0}")]
    MalformedInfoFile(String),

    #[error("command issued after the session was terminated")]
    SessionTerminated,

    #[error("back trace frame references unknown function id {function_id}")]
    MissingFunction { function_id: u64 },

    #[error("precondition violated: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode inbound frame: {0}")]
    Decode(String),
}

impl VmControllerError {
    /// True for the set of errors that end a session outright, as opposed to
    /// caller errors that leave the session usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VmControllerError::IllegalState(_))
    }
}
