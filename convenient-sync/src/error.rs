use convenient_graph::GraphError;
use convenient_storage::StorageError;
use thiserror::Error;

use crate::label::ParseLabelError;
use crate::pattern::ParsePatternError;
use crate::query::QueryError;

/// Errors that can occur during a sync pass
#[derive(Error, Debug)]
pub enum SyncError {
    /// Store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Load graph failure
    #[error("Load graph error: {0}")]
    Graph(#[from] GraphError),

    /// Query executor or hash contributor failure
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Caller cancelled the pass before the commit phase
    #[error("Sync pass cancelled")]
    Cancelled,

    /// Malformed label
    #[error(transparent)]
    InvalidLabel(#[from] ParseLabelError),

    /// Malformed target pattern
    #[error(transparent)]
    InvalidPattern(#[from] ParsePatternError),

    /// Snapshot file could not be read
    #[error("Failed to read snapshot {path}: {source}")]
    SnapshotIo {
        /// Snapshot path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Snapshot file is not valid JSON
    #[error("Invalid snapshot: {0}")]
    SnapshotFormat(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether stored state was found corrupted.
    ///
    /// Corruption clears the workspace state; the next pass is a full sync.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_corruption(),
            Self::Graph(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
