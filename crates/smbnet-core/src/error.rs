//! Error types for the SMB network filesystem

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw errno reported by the remote share client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EIO: Errno = Errno(libc::EIO);
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Errors returned by node operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("is a directory")]
    IsADirectory,

    #[error("not a directory")]
    NotADirectory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("directory cookie used after close")]
    CookieClosed,

    #[error("name too long")]
    NameTooLong,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("volume is read-only")]
    ReadOnly,

    #[error("unknown or stale handle")]
    BadHandle,

    #[error("remote call failed: {0}")]
    Remote(Errno),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Map to the errno reported to the host
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::CookieClosed => libc::EBADF,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::ReadOnly => libc::EROFS,
            FsError::BadHandle => libc::EBADF,
            FsError::Remote(errno) => errno.0,
        }
    }
}

/// Remote failures keep their code; common ones become typed variants
impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        match errno.0 {
            libc::ENOENT => FsError::NotFound,
            libc::EACCES | libc::EPERM => FsError::PermissionDenied,
            libc::EISDIR => FsError::IsADirectory,
            libc::ENOTDIR => FsError::NotADirectory,
            libc::EINVAL => FsError::InvalidArgument,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::EEXIST => FsError::AlreadyExists,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::EROFS => FsError::ReadOnly,
            _ => FsError::Remote(errno),
        }
    }
}

/// Notification channel framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("channel disconnected")]
    Disconnected,

    #[error("channel full")]
    Full,
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}
