//! Error types for the CBS driver.
//!
//! Each seam has its own `thiserror` enum; [`DriverError`] is the only error
//! the composition root hands back to `main`, and every variant of it is
//! fatal to the process.

use std::io;
use std::path::PathBuf;

use libcsi::CsiError;
use thiserror::Error;

/// Startup configuration could not be completed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("only unix socket is supported currently, got scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("failed to resolve {key} from instance metadata")]
    Metadata {
        key: &'static str,
        #[source]
        source: MetadataError,
    },
}

/// The instance metadata service could not answer.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Request(String),

    #[error("metadata service returned HTTP {0}")]
    Status(u16),

    #[error("metadata service returned an empty value")]
    Empty,
}

/// A cloud API call failed.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{action} request failed: {reason}")]
    Request {
        action: &'static str,
        reason: String,
    },

    #[error("{action} failed with {code}: {message}")]
    Api {
        action: &'static str,
        code: String,
        message: String,
    },

    #[error("failed to build cloud client: {0}")]
    Build(String),
}

/// The orchestrator API could not be reached or understood.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("orchestrator client config: {0}")]
    Config(String),

    #[error("orchestrator request failed: {0}")]
    Request(String),

    #[error("orchestrator returned HTTP {0}")]
    Status(u16),
}

/// The persisted extension cache could not be read or written.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cache record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("volume id {0:?} cannot name a cache record")]
    InvalidVolumeId(String),
}

/// One tag reconciliation pass failed as a whole.
#[derive(Debug, Error)]
pub enum TagSyncError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Fatal driver failures.  Every variant ends the process.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("failed to load metadata from store")]
    CacheLoad(#[source] CacheError),

    #[error("failed to register metrics")]
    Metrics(#[source] prometheus::Error),

    #[error("failed to prepare socket {path}")]
    SocketPrepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {path}")]
    Listen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSI server stopped")]
    Serve(#[source] CsiError),

    #[error("driver is already running")]
    AlreadyRunning,
}

impl From<CloudError> for CsiError {
    fn from(e: CloudError) -> Self {
        CsiError::backend(e)
    }
}

impl From<CacheError> for CsiError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::InvalidVolumeId(_) => CsiError::InvalidArgument(e.to_string()),
            e => CsiError::internal(e),
        }
    }
}
