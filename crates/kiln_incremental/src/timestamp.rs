//! Timestamp-only staleness strategy.

use std::path::{Path, PathBuf};

use kiln_common::PathRelativizer;
use kiln_store::{OpenStatus, StorageOwner, StoreError};

use crate::error::IncrementalError;
use crate::stamp::{read_attributes, FileAttributes, Stamp, StampStorage, StampTable};
use crate::target::TargetId;

/// Stamps files by modification time.
///
/// A file is up to date when its current modification time equals the one
/// recorded at its last compile for the target. Fast, but not meaningful
/// across machines or fresh checkouts.
pub struct TimestampStampStorage {
    table: StampTable<i64>,
}

impl TimestampStampStorage {
    /// Opens the store in `dir`, recreating it if corrupted.
    pub fn open(
        dir: &Path,
        relativizer: PathRelativizer,
    ) -> Result<(Self, OpenStatus), StoreError> {
        let (table, status) = StampTable::open(dir, relativizer)?;
        Ok((Self { table }, status))
    }
}

impl StampStorage for TimestampStampStorage {
    fn current_stamp(
        &self,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        let attrs = match attrs {
            Some(attrs) => *attrs,
            None => FileAttributes::read(file).map_err(|e| IncrementalError::io(file, e))?,
        };
        Ok(Stamp::Timestamp(attrs.modified))
    }

    fn previous_stamp(
        &self,
        file: &Path,
        target: TargetId,
    ) -> Result<Option<Stamp>, IncrementalError> {
        Ok(self.table.get(file, target)?.map(Stamp::Timestamp))
    }

    fn save_stamp(
        &self,
        file: &Path,
        target: TargetId,
        stamp: Stamp,
    ) -> Result<(), IncrementalError> {
        Ok(self.table.put(file, target, stamp.timestamp())?)
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
        Ok((attrs.modified == saved).then_some(Stamp::Timestamp(saved)))
    }
}

impl StorageOwner for TimestampStampStorage {
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
