//! CSI error types.
//!
//! All protocol-facing errors in the `libs3csi` crate are represented by the
//! [`CsiError`] enum, which derives [`thiserror::Error`] for ergonomic error
//! handling and also implements [`Serialize`]/[`Deserialize`] so errors can
//! travel across the QUIC transport layer.
//!
//! Every variant maps onto a stable [`StatusCode`] via [`CsiError::code`], so
//! callers on the far side of the transport can branch on the code without
//! parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::s3::StoreError;

/// Stable status code reported alongside every [`CsiError`].
///
/// The set mirrors the gRPC codes CSI assigns to each
/// failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    DeadlineExceeded,
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A volume with the same name but incompatible parameters exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The volume is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A bucket, metadata object or volume required by the call is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call was aborted, e.g. because of a malformed pagination token.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The RPC is not offered by this driver.
    #[error("{0} is not supported")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The mount helper ran but the kernel never reported the path mounted.
    #[error("timed out after {timeout_ms}ms waiting for {path} to be mounted")]
    MountTimeout { path: String, timeout_ms: u64 },

    /// The fuse helper serving `path` did not exit after unmount.
    #[error("timed out waiting for fuse process {pid} serving {path} to exit")]
    UnmountTimeout { path: String, pid: i32 },

    /// Objects survived both the bulk delete and the per-object fallback.
    #[error(
        "failed to remove {} object(s) from bucket {bucket}: {}",
        .objects.len(),
        .objects.join(", ")
    )]
    PartialDeleteFailure {
        bucket: String,
        objects: Vec<String>,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::InvalidArgument`].
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a [`CsiError::Unimplemented`] naming the RPC.
    pub fn unimplemented(rpc: &str) -> Self {
        Self::Unimplemented(rpc.to_owned())
    }

    /// The stable status code for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::Aborted(_) => StatusCode::Aborted,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
            Self::MountTimeout { .. } | Self::UnmountTimeout { .. } => StatusCode::DeadlineExceeded,
            Self::TransportError(_) => StatusCode::Unavailable,
            Self::Internal(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::PartialDeleteFailure { .. } => StatusCode::Internal,
        }
    }
}

impl From<StoreError> for CsiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::PartialDeleteFailure { bucket, objects } => {
                Self::PartialDeleteFailure { bucket, objects }
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("bucket data-01".into());
        assert_eq!(err.to_string(), "not found: bucket data-01");

        let err = CsiError::unimplemented("CreateSnapshot");
        assert_eq!(err.to_string(), "CreateSnapshot is not supported");
    }

    #[test]
    fn partial_delete_names_every_survivor() {
        let err = CsiError::PartialDeleteFailure {
            bucket: "b1".into(),
            objects: vec!["a".into(), "csi-fs/b".into()],
        };
        assert_eq!(
            err.to_string(),
            "failed to remove 2 object(s) from bucket b1: a, csi-fs/b"
        );
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[test]
    fn timeouts_map_to_deadline_exceeded() {
        let err = CsiError::MountTimeout {
            path: "/mnt/t".into(),
            timeout_ms: 10_000,
        };
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
        let err = CsiError::UnmountTimeout {
            path: "/mnt/t".into(),
            pid: 42,
        };
        assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    }

    #[test]
    fn store_not_found_converts_to_not_found() {
        let err: CsiError = StoreError::NotFound {
            bucket: "b1".into(),
            key: "csi-fs/metadata.json".into(),
        }
        .into();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), StatusCode::Internal);
    }
}
