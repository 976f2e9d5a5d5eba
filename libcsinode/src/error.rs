//! CSI node error types.
//!
//! Every operation in `libcsinode` returns [`CsiError`]. Errors raised by the
//! collaborators (record store, secret store, provisioner, driver RPCs) are
//! passed through as-is so callers can still tell a missing secret from a
//! refused one, or a timeout from a failed create, when deciding whether to
//! retry.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for node-side CSI operations.
#[derive(Debug, Error)]
pub enum CsiError {
    /// The volume source is missing or self-contradictory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A record, secret, driver descriptor or metadata file does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An object with the same name already exists in the store.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The attachment record did not report `attached` before the deadline.
    #[error(
        "timed out after {waited:?} waiting for attachment {attach_id} \
         [volume: {volume}, driver: {driver}]"
    )]
    Timeout {
        /// Name of the attachment record being observed.
        attach_id: String,
        /// Volume handle (or persistent volume name) behind the record.
        volume: String,
        /// Driver that owns the attachment.
        driver: String,
        /// How long the caller was willing to wait.
        waited: Duration,
    },

    /// An existing attachment record does not match the one being posted.
    #[error("attachment {attach_id} conflicts with existing record: {reason}")]
    Conflict {
        /// Name of the conflicting record.
        attach_id: String,
        /// Which field of the record differs.
        reason: String,
    },

    /// The external attach controller reported a failure on the record.
    #[error("attachment {attach_id} failed [driver: {driver}]: {message}")]
    AttachFailed {
        /// Name of the failed attachment record.
        attach_id: String,
        /// Driver that owns the attachment.
        driver: String,
        /// Message copied from `status.attach_error`.
        message: String,
    },

    /// Reading or writing a local file failed.
    #[error("i/o error at {path}: {source}")]
    Io {
        /// File or directory that was being accessed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A local file exists but does not hold a string→string JSON object.
    #[error("failed to decode {path}: {source}")]
    Decode {
        /// File that failed to decode.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The backing store refused access to an object.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Opaque failure reported by a collaborator.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl CsiError {
    /// Create a [`CsiError::Upstream`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn upstream<E: std::fmt::Display>(e: E) -> Self {
        Self::Upstream(e.to_string())
    }

    /// Create a [`CsiError::Io`] bound to `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
