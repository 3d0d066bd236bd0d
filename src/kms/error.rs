//! Commit and fence error types

use std::io;
use thiserror::Error;

/// Failure of a commit attempt
///
/// Every variant is raised before or by the atomic submission itself, so the
/// hardware never holds a partially applied transaction.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The transaction object could not be allocated
    #[error("failed to allocate atomic request")]
    OutOfMemory,

    /// A property write or blob registration was rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The kernel rejected the submission
    #[error("atomic commit failed: {0}")]
    Submission(#[source] io::Error),
}

impl CommitError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CommitError::InvalidArgument(msg.into())
    }

    /// Negative errno style code (`-ENOMEM`, `-EINVAL`, or the kernel's own)
    pub fn errno(&self) -> i32 {
        match self {
            CommitError::OutOfMemory => -libc::ENOMEM,
            CommitError::InvalidArgument(_) => -libc::EINVAL,
            CommitError::Submission(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Failure while waiting on a completion fence
#[derive(Debug, Error)]
pub enum FenceError {
    #[error("fence wait timed out after {0} ms")]
    Timeout(u64),

    #[error("fence wait failed: {0}")]
    Io(#[from] io::Error),
}
