use std::fmt::Display;
use thiserror::Error;

use crate::codec::CodecError;

/// Errors that can occur in storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem failure while reading or writing a region
    #[error("I/O error in region '{region}': {source}")]
    Io {
        /// Region the failure belongs to
        region: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded or decoded
    #[error("Codec error in region '{region}': {source}")]
    Codec {
        /// Region the failure belongs to
        region: String,
        /// Underlying error
        #[source]
        source: CodecError,
    },

    /// Persisted region data is unreadable
    #[error("Region '{region}' is corrupted: {reason}")]
    Corrupted {
        /// Region the failure belongs to
        region: String,
        /// What was wrong with it
        reason: String,
    },

    /// Region name is empty or contains path characters
    #[error("Invalid region name: '{0}'")]
    InvalidRegionName(String),

    /// Region was already opened in this context
    #[error("Region '{0}' is already open")]
    DuplicateRegion(String),
}

impl StorageError {
    pub(crate) fn io(region: &str, source: std::io::Error) -> Self {
        Self::Io {
            region: region.to_string(),
            source,
        }
    }

    pub(crate) fn codec(region: &str, source: CodecError) -> Self {
        Self::Codec {
            region: region.to_string(),
            source,
        }
    }

    pub(crate) fn corrupted(region: &str, reason: impl Display) -> Self {
        Self::Corrupted {
            region: region.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means stored data can no longer be trusted.
    ///
    /// Decoding failures of persisted values count as corruption: the bytes
    /// were written by this process family and should always decode.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::Codec { .. })
    }

    /// Name of the region involved, if any.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Io { region, .. } | Self::Codec { region, .. } | Self::Corrupted { region, .. } => {
                Some(region)
            }
            Self::InvalidRegionName(_) | Self::DuplicateRegion(_) => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
