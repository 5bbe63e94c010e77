//! Error types for incremental build data operations.

use std::path::PathBuf;

use kiln_config::ConfigError;
use kiln_store::StoreError;

/// Errors surfaced to the build driver.
///
/// Corruption of an individual store never appears here: it is recovered by
/// recreating the store and reporting a full rebuild through
/// [`BuildDataManager::full_rebuild_required`](crate::BuildDataManager::full_rebuild_required).
#[derive(Debug, thiserror::Error)]
pub enum IncrementalError {
    /// A keyed store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An I/O error occurred while reading a source file or auxiliary file.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An auxiliary file could not be encoded.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// The storage configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A long-running walk observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The hashing worker pool could not be started.
    #[error("failed to start worker pool: {reason}")]
    ThreadPool {
        /// Description of the failure.
        reason: String,
    },
}

impl IncrementalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IncrementalError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = IncrementalError::io(
            "src/A.java",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("src/A.java"));
    }

    #[test]
    fn store_error_is_transparent() {
        let err: IncrementalError = StoreError::Closed {
            path: PathBuf::from("timestamps"),
        }
        .into();
        assert_eq!(err.to_string(), "store at timestamps is closed");
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(IncrementalError::Cancelled.to_string(), "operation cancelled");
    }
}
