//! Error taxonomy for the core engine.
//!
//! Every fallible core operation returns a `RazorError` rather than
//! panicking or bubbling up through an exception. `Corruption` is the
//! only kind that is not purely local: observing it flips the engine's
//! consistency-check flag (see `engine::Engine::needs_consistency_check`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RazorError {
    #[error("no such file or directory")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid path: {0}")]
    InvalidPath(&'static str),

    #[error("name too long")]
    NameTooLong,

    #[error("permission denied")]
    PermissionDenied,

    #[error("quota exceeded")]
    Quota,

    #[error("out of space")]
    OutOfSpace,

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("compression error: {0}")]
    CompressionError(String),

    #[error("no such inode")]
    NoSuchInode,

    #[error("internal invariant violated: {0}")]
    Corruption(String),

    #[error("recovery required before further mutation")]
    RecoveryRequired,
}

impl RazorError {
    /// Maps an error kind to the closest standard OS error number for
    /// the FUSE boundary.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            RazorError::NotFound | RazorError::NoSuchInode => libc::ENOENT,
            RazorError::Exists => libc::EEXIST,
            RazorError::NotDirectory => libc::ENOTDIR,
            RazorError::IsDirectory => libc::EISDIR,
            RazorError::NotEmpty => libc::ENOTEMPTY,
            RazorError::InvalidPath(_) | RazorError::NameTooLong => libc::EINVAL,
            RazorError::PermissionDenied => libc::EACCES,
            RazorError::Quota | RazorError::OutOfSpace => libc::ENOSPC,
            RazorError::IOError(_) => libc::EIO,
            RazorError::CompressionError(_) => libc::EIO,
            RazorError::Corruption(_) => libc::EIO,
            RazorError::RecoveryRequired => libc::EROFS,
        }
    }
}

impl From<std::io::Error> for RazorError {
    fn from(e: std::io::Error) -> Self {
        RazorError::IOError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RazorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix_expectations() {
        assert_eq!(RazorError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(RazorError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(RazorError::OutOfSpace.to_errno(), libc::ENOSPC);
        assert_eq!(RazorError::NotEmpty.to_errno(), libc::ENOTEMPTY);
    }
}
