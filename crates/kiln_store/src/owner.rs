//! Uniform lifecycle for everything that owns on-disk state.

use crate::error::StoreError;

/// A component owning persistent state under its own directory.
///
/// The build data manager drives flush, clean and close across all stores
/// through this trait.
pub trait StorageOwner: Send + Sync {
    /// Writes pending changes to durable storage.
    fn flush(&self) -> Result<(), StoreError>;

    /// Deletes all persisted state and leaves the owner empty but usable.
    fn clean(&self) -> Result<(), StoreError>;

    /// Flushes and releases the owner. Later operations fail with
    /// [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}
