//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel back to the
//! caller inside a [`CsiMessage::Error`](crate::CsiMessage::Error).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The requested volume already exists with incompatible parameters.
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

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

    /// The cloud provider or storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A socket / framing error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No service registered on the server answers this method.
    #[error("method {0} is not implemented")]
    Unimplemented(String),

    /// A per-node or per-account limit has been reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

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

    /// gRPC-style status code name, used as a low-cardinality label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VolumeAlreadyExists(_) => "AlreadyExists",
            Self::VolumeNotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Unimplemented(_) => "Unimplemented",
            Self::ResourceExhausted(_) => "ResourceExhausted",
            Self::TransportError(_) => "Unavailable",
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("disk-123".into());
        assert_eq!(err.to_string(), "volume disk-123 not found");
    }

    #[test]
    fn error_codes() {
        assert_eq!(CsiError::Unimplemented("x".into()).code(), "Unimplemented");
        assert_eq!(CsiError::transport("reset").code(), "Unavailable");
        assert_eq!(
            CsiError::MountFailed {
                path: "/mnt".into(),
                reason: "busy".into()
            }
            .code(),
            "Internal"
        );
    }

    #[test]
    fn error_survives_json() {
        let err = CsiError::UnmountFailed {
            path: "/mnt/test".into(),
            reason: "device busy".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
