//! Durable key-value storage underneath every Kiln build data store.
//!
//! A [`KeyedStore`] is an in-memory map snapshotted to a single checksummed
//! file inside the directory it owns. Corruption is reported as a typed
//! [`StoreError::Corrupted`]; [`KeyedStore::open_or_recreate`] turns it into
//! an empty store and tells the caller so it can schedule a full rebuild.

#![warn(missing_docs)]

pub mod error;
pub mod format;
pub mod owner;
pub mod store;

pub use error::StoreError;
pub use owner::StorageOwner;
pub use store::{KeyedStore, OpenStatus, DATA_FILE};
