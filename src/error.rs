//! Error types
//!
//! Every failure an acquire can end with is a distinct variant so the serving
//! layer can tell an unreachable camera from a slow one from a missing one.
//! The type is `Clone` because a single creation failure is delivered to all
//! viewers that were waiting on the same session.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::StreamKey;

/// Error type for stream manager operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Device or channel missing, or the channel is inactive
    #[error("not found: {0}")]
    NotFound(String),

    /// The source could not be reached or rejected our credentials
    #[error("upstream unreachable for {key}: {reason}")]
    UpstreamUnreachable { key: StreamKey, reason: String },

    /// The transcoder never produced a playable manifest
    #[error("stream {key} not ready after {waited:?}")]
    ReadinessTimeout { key: StreamKey, waited: Duration },

    /// The transcoder of a ready session exited on its own
    #[error("transcoder for {key} exited unexpectedly ({status})")]
    ProcessCrashed { key: StreamKey, status: String },

    /// The transcoder could not be launched
    #[error("failed to spawn transcoder for {key}: {source}")]
    Spawn {
        key: StreamKey,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Filesystem error while preparing output
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The transcoder survived a kill
    #[error("transcoder for {0} did not exit")]
    Unresponsive(StreamKey),

    /// Every caller waiting on the session went away
    #[error("acquire for {0} was cancelled")]
    Cancelled(StreamKey),

    /// The manager is shutting down
    #[error("stream manager is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::UpstreamUnreachable { .. } => "UPSTREAM_UNREACHABLE",
            Error::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Error::ProcessCrashed { .. } => "PROCESS_CRASHED",
            Error::Spawn { .. } => "SPAWN_FAILED",
            Error::Io(_) => "IO_ERROR",
            Error::Unresponsive(_) => "UNRESPONSIVE",
            Error::Cancelled(_) => "CANCELLED",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnreachable { .. }
                | Error::ReadinessTimeout { .. }
                | Error::ProcessCrashed { .. }
                | Error::Cancelled(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result alias for stream manager operations
pub type Result<T> = std::result::Result<T, Error>;
