use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors surfaced by the ingestion components.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The upload is missing required fields or slots. Never queued.
    #[error("invalid upload: {0}")]
    Validation(String),

    /// The bounded job queue is full; the job was not accepted.
    #[error("job queue is full ({capacity} pending jobs)")]
    QueueSaturated { capacity: usize },

    #[error("asset not found: {0}")]
    NotFound(String),

    /// The classification or search provider failed or returned malformed data.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("failed to {action} {}: {source}", .path.display())]
    Storage {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unreadable asset {}: {reason}", .path.display())]
    UnreadableAsset { path: PathBuf, reason: String },

    #[error("timed out after {waited:?} waiting for ledger lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("scheduler is shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ::config::ConfigError),
}

impl IngestError {
    pub(crate) fn storage(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        IngestError::Storage {
            action,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IngestError::UnreadableAsset {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn provider(err: anyhow::Error) -> Self {
        IngestError::Provider(format!("{err:#}"))
    }
}
