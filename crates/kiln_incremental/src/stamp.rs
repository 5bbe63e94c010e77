//! Stamps: the recorded state of a source file at its last compile.
//!
//! A stamp store maps a normalized file path to a small array of
//! `(TargetId, value)` pairs, one per target that compiled the file. Arrays
//! almost always hold a single element and are scanned linearly.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use kiln_common::{ContentHash, PathRelativizer};
use kiln_store::{KeyedStore, OpenStatus, StorageOwner, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::IncrementalError;
use crate::target::TargetId;

/// File metadata consulted by staleness checks.
///
/// Callers that already hold the metadata (e.g. from a directory walk) pass it
/// in to avoid a second `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// Last modification time, milliseconds since the Unix epoch.
    pub modified: i64,
    /// File length in bytes.
    pub len: u64,
}

impl FileAttributes {
    /// Reads the attributes of `path` from the file system.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified = match meta.modified()?.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };
        Ok(Self {
            modified,
            len: meta.len(),
        })
    }
}

/// The state recorded for a file after a successful compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stamp {
    /// Modification time only.
    Timestamp(i64),
    /// Content digest plus the modification time it was computed at.
    Hashed {
        /// Digest of the file content.
        hash: ContentHash,
        /// Modification time when the digest was taken.
        timestamp: i64,
    },
}

impl Stamp {
    /// The modification time recorded in this stamp.
    pub fn timestamp(&self) -> i64 {
        match self {
            Stamp::Timestamp(ts) => *ts,
            Stamp::Hashed { timestamp, .. } => *timestamp,
        }
    }

    /// The content digest, if this stamp carries one.
    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            Stamp::Timestamp(_) => None,
            Stamp::Hashed { hash, .. } => Some(*hash),
        }
    }
}

/// Per-file array of `(target, value)` slots.
///
/// Holds at most one slot per target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampArray<V>(Vec<(TargetId, V)>);

impl<V> Default for StampArray<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V: Copy> StampArray<V> {
    /// Returns the value recorded for `target`.
    pub fn get(&self, target: TargetId) -> Option<V> {
        self.0
            .iter()
            .find(|(id, _)| *id == target)
            .map(|(_, value)| *value)
    }

    /// Overwrites the slot for `target` in place, or appends a new one.
    pub fn put(&mut self, target: TargetId, value: V) {
        match self.0.iter_mut().find(|(id, _)| *id == target) {
            Some(slot) => slot.1 = value,
            None => self.0.push((target, value)),
        }
    }

    /// Removes the slot for `target`. Returns `true` if one existed.
    pub fn remove(&mut self, target: TargetId) -> bool {
        match self.0.iter().position(|(id, _)| *id == target) {
            Some(index) => {
                self.0.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of targets with a slot.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no target has a slot.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A staleness strategy.
///
/// Implementations answer whether a file is unchanged since the stamp last
/// saved for a target, and record new stamps after compiles.
pub trait StampStorage: StorageOwner {
    /// Computes the stamp `file` would get if saved now.
    fn current_stamp(
        &self,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError>;

    /// Returns the stamp last saved for `file` and `target`.
    fn previous_stamp(&self, file: &Path, target: TargetId)
        -> Result<Option<Stamp>, IncrementalError>;

    /// Records `stamp` for `file` and `target`.
    fn save_stamp(&self, file: &Path, target: TargetId, stamp: Stamp)
        -> Result<(), IncrementalError>;

    /// Removes the stamp of `file` for `target`.
    fn remove_stamp(&self, file: &Path, target: TargetId) -> Result<(), IncrementalError>;

    /// Removes every stamp of `target`. Returns the number of files that no
    /// longer have any stamp.
    fn remove_all_stamps(&self, target: TargetId) -> Result<usize, IncrementalError>;

    /// Files that have a stamp for `target`.
    fn tracked_files(&self, target: TargetId) -> Result<Vec<PathBuf>, IncrementalError>;

    /// Returns the current stamp if `file` is unchanged for `target`, or
    /// `None` if it is dirty (changed, deleted, or never compiled).
    fn current_stamp_if_up_to_date(
        &self,
        file: &Path,
        target: TargetId,
        attrs: Option<&FileAttributes>,
    ) -> Result<Option<Stamp>, IncrementalError>;

    /// Computes and records the current stamp of `file` for `target`.
    fn update_stamp(
        &self,
        file: &Path,
        target: TargetId,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        let stamp = self.current_stamp(file, attrs)?;
        self.save_stamp(file, target, stamp)?;
        Ok(stamp)
    }
}

/// Keyed store of per-file [`StampArray`]s shared by both strategies.
pub(crate) struct StampTable<V> {
    store: KeyedStore<String, StampArray<V>>,
    relativizer: PathRelativizer,
}

impl<V> StampTable<V>
where
    V: Copy + Serialize + DeserializeOwned + Send + Sync,
{
    pub(crate) fn open(
        dir: &Path,
        relativizer: PathRelativizer,
    ) -> Result<(Self, OpenStatus), StoreError> {
        let (store, status) = KeyedStore::open_or_recreate(dir)?;
        Ok((Self { store, relativizer }, status))
    }

    pub(crate) fn get(&self, file: &Path, target: TargetId) -> Result<Option<V>, StoreError> {
        let key = self.relativizer.to_key(file);
        Ok(self.store.get(&key)?.and_then(|array| array.get(target)))
    }

    pub(crate) fn put(&self, file: &Path, target: TargetId, value: V) -> Result<(), StoreError> {
        let key = self.relativizer.to_key(file);
        self.store.compute(key, |old| {
            let mut array = old.unwrap_or_default();
            array.put(target, value);
            Some(array)
        })?;
        Ok(())
    }

    pub(crate) fn remove(&self, file: &Path, target: TargetId) -> Result<(), StoreError> {
        let key = self.relativizer.to_key(file);
        self.store.compute(key, |old| {
            let mut array = old?;
            array.remove(target);
            (!array.is_empty()).then_some(array)
        })?;
        Ok(())
    }

    pub(crate) fn remove_target(&self, target: TargetId) -> Result<usize, StoreError> {
        self.store.retain(|_, array| {
            array.remove(target);
            !array.is_empty()
        })
    }

    pub(crate) fn files_for(&self, target: TargetId) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        self.store.for_each(|key, array| {
            if array.get(target).is_some() {
                files.push(self.relativizer.to_path(key));
            }
        })?;
        files.sort();
        Ok(files)
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self, file: &Path) -> usize {
        let key = self.relativizer.to_key(file);
        self.store
            .get(&key)
            .ok()
            .flatten()
            .map_or(0, |array| array.len())
    }

    pub(crate) fn store(&self) -> &KeyedStore<String, StampArray<V>> {
        &self.store
    }
}

/// Reads attributes, mapping a vanished file to `None`.
pub(crate) fn read_attributes(
    file: &Path,
    attrs: Option<&FileAttributes>,
) -> Result<Option<FileAttributes>, IncrementalError> {
    if let Some(attrs) = attrs {
        return Ok(Some(*attrs));
    }
    match FileAttributes::read(file) {
        Ok(attrs) => Ok(Some(attrs)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IncrementalError::io(file, e)),
    }
}
