use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reading or writing the on-disk state of the pipeline.
///
/// These never reach producer threads. The worker logs them and carries on,
/// deleting whatever file turned out to be unusable.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt retry file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: &'static str },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not lock {path} after {attempts} attempts")]
    LockContended { path: PathBuf, attempts: u32 },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if the file that produced this error should be deleted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, PersistenceError::Corrupt { .. })
    }
}

/// Failure encoding a batch into a [`TracePayload`](crate::payload::TracePayload).
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
}
