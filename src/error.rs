//! Error types for shmpipe

use std::io;
use thiserror::Error;

/// Result type for shmpipe operations
pub type Result<T> = std::result::Result<T, ShmPipeError>;

/// Errors that can occur on a shmpipe session
#[derive(Debug, Error)]
pub enum ShmPipeError {
    /// A non-blocking operation found the ring full (write) or empty (read)
    #[error("operation would block")]
    WouldBlock,

    /// The session handle was already closed
    #[error("session is closed")]
    Closed,

    /// The peer process is gone; the session is no longer usable
    #[error("peer disconnected")]
    BrokenPipe,

    /// A blocking wait was interrupted by a signal
    #[error("interrupted by signal")]
    Interrupted,

    /// No session with this name exists
    #[error("session '{name}' not found")]
    NotFound { name: String },

    /// A session with this name already exists
    #[error("session '{name}' already exists")]
    AlreadyExists { name: String },

    /// Invalid segment magic number
    #[error("bad segment magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    BadMagic { expected: u32, got: u32 },

    /// Unsupported segment format version
    #[error("unsupported segment version: expected {expected}, got {got}")]
    BadVersion { expected: u32, got: u32 },

    /// The segment contents are structurally inconsistent
    #[error("malformed segment: {reason}")]
    Malformed { reason: &'static str },

    /// Session name is unusable
    #[error("invalid session name '{got}': {reason}")]
    InvalidName { got: String, reason: &'static str },

    /// Ring capacity must be a power of two within the supported range
    #[error("invalid ring capacity {got}: must be a power of two in [2, 1 GiB]")]
    InvalidCapacity { got: u32 },

    /// Missing permissions on the backing OS objects
    #[error("permission denied for session '{name}'")]
    PermissionDenied { name: String },

    /// The OS refused to provision resources (memory, fds, disk)
    #[error("out of resources: {source}")]
    ResourceExhausted {
        #[source]
        source: io::Error,
    },

    /// Unexpected OS-level failure
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ShmPipeError {
    /// Map an errno from a lifecycle syscall into the session error set.
    pub(crate) fn from_os(op: &'static str, name: &str, errno: rustix::io::Errno) -> Self {
        use rustix::io::Errno;
        match errno {
            Errno::EXIST => Self::AlreadyExists {
                name: name.to_string(),
            },
            Errno::NOENT => Self::NotFound {
                name: name.to_string(),
            },
            Errno::ACCESS | Errno::PERM => Self::PermissionDenied {
                name: name.to_string(),
            },
            Errno::NOMEM | Errno::MFILE | Errno::NFILE | Errno::NOSPC => {
                Self::ResourceExhausted {
                    source: errno.into(),
                }
            }
            other => Self::Io {
                op,
                source: other.into(),
            },
        }
    }
}

impl From<ShmPipeError> for io::Error {
    fn from(err: ShmPipeError) -> io::Error {
        use io::ErrorKind;
        let kind = match &err {
            ShmPipeError::WouldBlock => ErrorKind::WouldBlock,
            ShmPipeError::Closed => ErrorKind::NotConnected,
            ShmPipeError::BrokenPipe => ErrorKind::BrokenPipe,
            ShmPipeError::Interrupted => ErrorKind::Interrupted,
            ShmPipeError::NotFound { .. } => ErrorKind::NotFound,
            ShmPipeError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ShmPipeError::BadMagic { .. }
            | ShmPipeError::BadVersion { .. }
            | ShmPipeError::Malformed { .. } => ErrorKind::InvalidData,
            ShmPipeError::InvalidName { .. } | ShmPipeError::InvalidCapacity { .. } => {
                ErrorKind::InvalidInput
            }
            ShmPipeError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ShmPipeError::ResourceExhausted { .. } => ErrorKind::OutOfMemory,
            ShmPipeError::Io { source, .. } => source.kind(),
        };
        io::Error::new(kind, err)
    }
}
