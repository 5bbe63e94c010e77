//! Error types for keyed store operations.

use std::path::PathBuf;

/// Errors that can occur while reading, writing or recreating a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred while reading or writing store files.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The backing file exists but cannot be trusted.
    ///
    /// The only recovery is to wipe the store and treat everything it tracked
    /// as dirty.
    #[error("store at {path} is corrupted: {reason}")]
    Corrupted {
        /// The backing file that failed validation.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// A serialization error occurred while encoding a snapshot.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The store was closed, or a wipe failed and left it unusable.
    #[error("store at {path} is closed")]
    Closed {
        /// The store directory.
        path: PathBuf,
    },
}

impl StoreError {
    /// Returns `true` for [`StoreError::Corrupted`].
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupted { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
