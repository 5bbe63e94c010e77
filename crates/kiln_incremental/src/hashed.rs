//! Content-hash staleness strategy for portable caches.
//!
//! Each slot records the file digest together with the modification time the
//! digest was taken at. Checking a file is two-tiered:
//!
//! 1. If the modification time is unchanged the file is clean and is not read.
//! 2. Otherwise the content is rehashed; the file is clean iff the digest
//!    still matches.
//!
//! Because keys are project-relative and the decisive comparison is on
//! content, the data survives being copied to another machine or checkout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{ContentHash, ContentHasher, PathRelativizer};
use kiln_store::{OpenStatus, StorageOwner, StoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IncrementalError;
use crate::stamp::{read_attributes, FileAttributes, Stamp, StampStorage, StampTable};
use crate::target::TargetId;

/// Value stored per `(file, target)` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HashEntry {
    hash: ContentHash,
    timestamp: i64,
}

impl HashEntry {
    fn stamp(self) -> Stamp {
        Stamp::Hashed {
            hash: self.hash,
            timestamp: self.timestamp,
        }
    }
}

/// Stamps files by content digest, using timestamps only as a shortcut.
pub struct HashStampStorage {
    table: StampTable<HashEntry>,
    hasher: Arc<dyn ContentHasher>,
}

impl HashStampStorage {
    /// Opens the store in `dir`, recreating it if corrupted.
    pub fn open(
        dir: &Path,
        relativizer: PathRelativizer,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<(Self, OpenStatus), StoreError> {
        let (table, status) = StampTable::open(dir, relativizer)?;
        Ok((Self { table, hasher }, status))
    }

    /// Hashes the content of `file`, or `None` if it no longer exists.
    fn hash_file(&self, file: &Path) -> Result<Option<ContentHash>, IncrementalError> {
        match std::fs::read(file) {
            Ok(content) => Ok(Some(self.hasher.hash(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IncrementalError::io(file, e)),
        }
    }
}

impl StampStorage for HashStampStorage {
    fn current_stamp(
        &self,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        let attrs = match attrs {
            Some(attrs) => *attrs,
            None => FileAttributes::read(file).map_err(|e| IncrementalError::io(file, e))?,
        };
        let content = std::fs::read(file).map_err(|e| IncrementalError::io(file, e))?;
        Ok(Stamp::Hashed {
            hash: self.hasher.hash(&content),
            timestamp: attrs.modified,
        })
    }

    fn previous_stamp(
        &self,
        file: &Path,
        target: TargetId,
    ) -> Result<Option<Stamp>, IncrementalError> {
        Ok(self.table.get(file, target)?.map(HashEntry::stamp))
    }

    fn save_stamp(
        &self,
        file: &Path,
        target: TargetId,
        stamp: Stamp,
    ) -> Result<(), IncrementalError> {
        let hash = match stamp.hash() {
            Some(hash) => hash,
            // A timestamp-only stamp carries no digest; take one now.
            None => match self.hash_file(file)? {
                Some(hash) => hash,
                None => {
                    return Err(IncrementalError::io(
                        file,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
                    ))
                }
            },
        };
        let entry = HashEntry {
            hash,
            timestamp: stamp.timestamp(),
        };
        Ok(self.table.put(file, target, entry)?)
    }

    fn remove_stamp(&self, file: &Path, target: TargetId) -> Result<(), IncrementalError> {
        Ok(self.table.remove(file, target)?)
    }

    fn remove_all_stamps(&self, target: TargetId) -> Result<usize, IncrementalError> {
        Ok(self.table.remove_target(target)?)
    }

    fn tracked_files(&self, target: TargetId) -> Result<Vec<PathBuf>, IncrementalError> {
        Ok(self.table.files_for(target)?)
    }

    fn current_stamp_if_up_to_date(
        &self,
        file: &Path,
        target: TargetId,
        attrs: Option<&FileAttributes>,
    ) -> Result<Option<Stamp>, IncrementalError> {
        let Some(saved) = self.table.get(file, target)? else {
            return Ok(None);
        };
        let Some(attrs) = read_attributes(file, attrs)? else {
            return Ok(None);
        };
        if attrs.modified == saved.timestamp {
            return Ok(Some(saved.stamp()));
        }

        let Some(hash) = self.hash_file(file)? else {
            return Ok(None);
        };
        if hash == saved.hash {
            debug!("{} touched but content unchanged", file.display());
            Ok(Some(Stamp::Hashed {
                hash,
                timestamp: attrs.modified,
            }))
        } else {
            Ok(None)
        }
    }
}

impl StorageOwner for HashStampStorage {
    fn flush(&self) -> Result<(), StoreError> {
        self.table.store().force()
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.table.store().wipe()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.table.store().close()
    }
}
