//! Error taxonomy.

use std::io;
use std::os::raw::c_int;

use thiserror::Error;

use crate::attr::AttrError;
use crate::mount::MountState;

/// Result type of mount and resolution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the mount controller and identity cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol or connection failure reported by the transport. Never retried
    /// here.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Two cached objects competed for one identity. Indicates a defect in the
    /// cache.
    #[error("identity conflict for qid path {key:#x}")]
    IdentityConflict { key: u64 },

    /// Unmount found outstanding references and was not forced.
    #[error("mount is busy: {outstanding} cached files still referenced")]
    Busy { outstanding: usize },

    /// The forced unmount retry loop was interrupted.
    #[error("unmount interrupted")]
    Interrupted,

    /// Operation attempted in the wrong state of the mount state machine.
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: MountState },

    /// A stat reply could not be translated into complete attributes.
    #[error("invalid attributes: {0}")]
    InvalidAttributes(#[from] AttrError),

    /// The attach root or a walk parent is not a directory.
    #[error("not a directory")]
    NotADirectory,

    /// Unknown or malformed mount option.
    #[error("invalid mount option: {0}")]
    InvalidOption(String),

    /// Requested feature is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Maps the error onto an `errno` value the VFS layer can reply with.
    pub fn errno(&self) -> c_int {
        match self {
            Error::Transport(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::IdentityConflict { .. } => libc::EIO,
            Error::Busy { .. } => libc::EBUSY,
            Error::Interrupted => libc::EINTR,
            Error::InvalidState { .. } => libc::EINVAL,
            Error::InvalidAttributes(_) => libc::EIO,
            Error::NotADirectory => libc::ENOTDIR,
            Error::InvalidOption(_) => libc::EINVAL,
            Error::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }
}
