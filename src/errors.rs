//! Error types for the GVFS-Core crate.
//!
//! This module defines a unified error enumeration used across object I/O,
//! index projection, hydration, the cross-process lock, maintenance, and the
//! pipe router. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Every variant maps onto one [`ErrorClass`], which decides how callers react:
//! transient errors are retried with backoff, auth errors get one credential
//! refresh, corruption fails the operation loudly, precondition errors become
//! typed IPC responses, and fatal errors tear the mount down.

use thiserror::Error;

/// How a failure should be handled by the layer that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff: network failures, 5xx responses, EAGAIN.
    Transient,
    /// One-shot credential refresh then retry; otherwise surface.
    Auth,
    /// Checksum mismatch, parse failure. Fatal for the operation, traced
    /// as critical, never silently masked.
    Corruption,
    /// Mount state or version mismatch, surfaced as a typed IPC response.
    Precondition,
    /// A `git` sub-process exited non-zero; carries its output.
    External,
    /// A state-machine invariant broke. Abort the mount after flushing logs.
    Fatal,
}

#[derive(Error, Debug)]
/// Unified error enumeration for the GVFS-Core crate.
pub enum GvfsError {
    /// Malformed object id (bad hex or wrong length).
    #[error("The `{0}` is not a valid object id.")]
    InvalidObjectId(String),

    /// Invalid or unsupported git object type name.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Object body did not match its id or advertised length.
    #[error("Object `{0}` is corrupt: {1}")]
    CorruptObject(String, String),

    /// Malformed or unsupported pack index (.idx / multi-pack-index) file.
    #[error("The `{0}` is not a valid pack index file.")]
    InvalidPackIndex(String),

    /// Malformed or unsupported pack file.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Malformed or unsupported git index file.
    #[error("The `{0}` is not a valid index file: {1}")]
    InvalidIndexFile(String, String),

    /// Object missing locally and not downloadable.
    #[error("Can't find object `{0}` locally or at the object service")]
    ObjectNotFound(String),

    /// Path is not in the projection and not journaled.
    #[error("Path `{0}` is not projected")]
    PathNotProjected(String),

    /// I/O error from the underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Network communication failed in a retryable way.
    #[error("Network Error: {0}")]
    NetworkError(String),

    /// The object service answered with a retryable server error.
    #[error("Object service returned HTTP {0}")]
    ServerError(u16),

    /// The object service rejected our credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential helper could not produce usable credentials.
    #[error("Credential helper failed: {0}")]
    CredentialHelper(String),

    /// Operation arrived while the mount was not in the required state.
    #[error("Mount is not ready (state: {0})")]
    MountNotReady(String),

    /// Request arrived during unmount.
    #[error("Unmount is in progress")]
    UnmountInProgress,

    /// On-disk layout version is newer than this build understands.
    #[error("Disk layout version {found} is not supported (max {supported})")]
    UnsupportedLayout { found: u32, supported: u32 },

    /// Invalid IPC request payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A `git` sub-process exited non-zero.
    #[error("git {command} exited with {code}: {stderr}")]
    GitCommand {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// Enlistment metadata is missing or unreadable.
    #[error("Enlistment metadata error: {0}")]
    Metadata(String),

    /// A state-machine invariant broke; the mount must come down.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl GvfsError {
    /// Classify this error for retry/surface decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            GvfsError::NetworkError(_) | GvfsError::ServerError(_) => ErrorClass::Transient,
            GvfsError::Unauthorized(_) | GvfsError::CredentialHelper(_) => ErrorClass::Auth,
            GvfsError::CorruptObject(..)
            | GvfsError::InvalidPackIndex(_)
            | GvfsError::InvalidPackFile(_)
            | GvfsError::InvalidIndexFile(..) => ErrorClass::Corruption,
            GvfsError::MountNotReady(_)
            | GvfsError::UnmountInProgress
            | GvfsError::UnsupportedLayout { .. }
            | GvfsError::InvalidRequest(_)
            | GvfsError::InvalidObjectId(_)
            | GvfsError::InvalidObjectType(_) => ErrorClass::Precondition,
            GvfsError::GitCommand { .. } => ErrorClass::External,
            GvfsError::Invariant(_) => ErrorClass::Fatal,
            GvfsError::IOError(_)
            | GvfsError::ObjectNotFound(_)
            | GvfsError::PathNotProjected(_)
            | GvfsError::Metadata(_)
            | GvfsError::CustomError(_) => ErrorClass::Corruption,
        }
    }

    /// True when the retry loop should try again after backing off.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Network failures and 5xx responses are retryable, nothing else is.
    #[test]
    fn test_retryable_classes() {
        assert!(GvfsError::NetworkError("timed out".into()).is_retryable());
        assert!(GvfsError::ServerError(503).is_retryable());
        assert!(!GvfsError::Unauthorized("401".into()).is_retryable());
        assert!(!GvfsError::CorruptObject("abc".into(), "bad zlib".into()).is_retryable());
        assert!(!GvfsError::UnmountInProgress.is_retryable());
    }

    /// Auth failures classify separately so the client refreshes exactly once.
    #[test]
    fn test_auth_class() {
        assert_eq!(
            GvfsError::Unauthorized("rejected".into()).class(),
            ErrorClass::Auth
        );
        assert_eq!(
            GvfsError::CredentialHelper("no helper".into()).class(),
            ErrorClass::Auth
        );
    }

    /// Invariant breakage is the only fatal class.
    #[test]
    fn test_fatal_class() {
        assert_eq!(
            GvfsError::Invariant("placeholder state went backwards".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            GvfsError::GitCommand {
                command: "multi-pack-index".into(),
                code: 128,
                stdout: String::new(),
                stderr: "fatal: bad ref".into(),
            }
            .class(),
            ErrorClass::External
        );
    }
}
