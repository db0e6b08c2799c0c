//! Error types for the invoker↔booster connection.
//!
//! Every variant here is connection-fatal: the booster logs it, closes the
//! accepted socket, and exits non-zero. The daemon sees only the child's exit
//! status.

use std::io;
use thiserror::Error;

/// A fatal error while driving the launch protocol on one connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed or stalled mid-frame.
    #[error("short read on connection")]
    ShortRead,

    /// Accepting a client on the family socket failed.
    #[error("accepting connection failed")]
    AcceptFailed,

    /// The opening word did not carry the magic tag.
    #[error("bad magic word ({0:#010x})")]
    BadMagic(u32),

    /// Magic tag was present but the version sub-field is unsupported.
    #[error("unsupported magic version ({0:#010x})")]
    BadVersion(u32),

    /// An action code outside the defined set.
    #[error("invalid action ({0:#010x})")]
    UnknownAction(u32),

    /// String length prefix of zero or beyond the per-string cap.
    #[error("string length {0} out of bounds")]
    StringLength(u32),

    /// A received string was not NUL-terminated.
    #[error("string missing NUL terminator")]
    MissingNul,

    /// Environment variable count outside the accepted range.
    #[error("invalid environment variable count {0}")]
    EnvCount(u32),

    /// The SCM_RIGHTS control message was truncated, absent, or carried the
    /// wrong number of descriptors.
    #[error("invalid descriptor control message")]
    BadControlMessage,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<nix::errno::Errno> for ProtocolError {
    fn from(errno: nix::errno::Errno) -> Self {
        ProtocolError::Io(io::Error::from(errno))
    }
}
