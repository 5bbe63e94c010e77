//! Project-wide stamp facade.
//!
//! Selects the staleness strategy once per project and routes every stamp
//! query to it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_common::{ContentHasher, PathRelativizer};
use kiln_store::{OpenStatus, StorageOwner, StoreError};
use tracing::{info, warn};

use crate::error::IncrementalError;
use crate::hashed::HashStampStorage;
use crate::paths::BuildDataPaths;
use crate::stamp::{FileAttributes, Stamp, StampStorage};
use crate::target::TargetId;
use crate::timestamp::TimestampStampStorage;

/// The stamp store of one project.
///
/// With `portable` set, files are stamped by content hash and keyed relative
/// to the project root; otherwise by modification time.
pub struct ProjectStamps {
    storage: Box<dyn StampStorage>,
    portable: bool,
    rebuild_required: AtomicBool,
}

impl ProjectStamps {
    /// Opens the stamp store under `paths`, recreating it if corrupted.
    pub fn open(
        paths: &BuildDataPaths,
        portable: bool,
        relativizer: PathRelativizer,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self, StoreError> {
        let (storage, status): (Box<dyn StampStorage>, OpenStatus) = if portable {
            let (storage, status) =
                HashStampStorage::open(&paths.hashes_dir(), relativizer, hasher)?;
            (Box::new(storage), status)
        } else {
            let (storage, status) =
                TimestampStampStorage::open(&paths.timestamps_dir(), relativizer)?;
            (Box::new(storage), status)
        };

        let stamps = Self {
            storage,
            portable,
            rebuild_required: AtomicBool::new(false),
        };
        if let OpenStatus::Recreated { reason } = status {
            stamps.require_rebuild(&reason);
        }
        Ok(stamps)
    }

    fn require_rebuild(&self, reason: &str) {
        warn!("stamp data lost ({}), all targets will be rebuilt", reason);
        self.rebuild_required.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if stamp data was lost and every target must be
    /// rebuilt from scratch.
    pub fn full_rebuild_required(&self) -> bool {
        self.rebuild_required.load(Ordering::SeqCst)
    }

    /// Returns `true` when content hashes are used.
    pub fn is_portable(&self) -> bool {
        self.portable
    }

    /// The active strategy.
    pub fn storage(&self) -> &dyn StampStorage {
        self.storage.as_ref()
    }

    /// Returns the current stamp if `file` is clean for `target`.
    pub fn current_stamp_if_up_to_date(
        &self,
        file: &Path,
        target: TargetId,
        attrs: Option<&FileAttributes>,
    ) -> Result<Option<Stamp>, IncrementalError> {
        self.storage.current_stamp_if_up_to_date(file, target, attrs)
    }

    /// Computes the stamp `file` would get if saved now.
    pub fn current_stamp(
        &self,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        self.storage.current_stamp(file, attrs)
    }

    /// Returns the stamp last saved for `file` and `target`.
    pub fn previous_stamp(
        &self,
        file: &Path,
        target: TargetId,
    ) -> Result<Option<Stamp>, IncrementalError> {
        self.storage.previous_stamp(file, target)
    }

    /// Records the current state of `file` after `target` compiled it.
    pub fn record_compiled(
        &self,
        file: &Path,
        target: TargetId,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        self.storage.update_stamp(file, target, attrs)
    }

    /// Records `stamp` for `file` and `target` as is.
    pub fn save_stamp(
        &self,
        file: &Path,
        target: TargetId,
        stamp: Stamp,
    ) -> Result<(), IncrementalError> {
        self.storage.save_stamp(file, target, stamp)
    }

    /// Forgets `file` for `target`, e.g. after the source was deleted.
    pub fn record_removed(&self, file: &Path, target: TargetId) -> Result<(), IncrementalError> {
        self.storage.remove_stamp(file, target)
    }

    /// Forgets every stamp of `target`.
    pub fn remove_target(&self, target: TargetId) -> Result<usize, IncrementalError> {
        self.storage.remove_all_stamps(target)
    }

    /// Files with a stamp for `target`.
    pub fn tracked_files(&self, target: TargetId) -> Result<Vec<PathBuf>, IncrementalError> {
        self.storage.tracked_files(target)
    }

    /// Discards all stamps. Every file is dirty afterwards.
    pub fn wipe(&self) -> Result<(), StoreError> {
        info!("discarding all file stamps");
        self.storage.clean()
    }
}

impl StorageOwner for ProjectStamps {
    fn flush(&self) -> Result<(), StoreError> {
        self.storage.flush()
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.storage.clean()?;
        self.rebuild_required.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::Xxh3Hasher;
    use kiln_store::DATA_FILE;

    fn open(root: &Path, portable: bool) -> ProjectStamps {
        let relativizer = if portable {
            PathRelativizer::portable(root)
        } else {
            PathRelativizer::absolute()
        };
        ProjectStamps::open(
            &BuildDataPaths::new(&root.join(".kiln")),
            portable,
            relativizer,
            Arc::new(Xxh3Hasher),
        )
        .unwrap()
    }

    #[test]
    fn strategy_follows_portable_flag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.java");
        std::fs::write(&file, "class A {}").unwrap();

        let stamps = open(dir.path(), false);
        assert!(!stamps.is_portable());
        let stamp = stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
        assert!(stamp.hash().is_none());
        stamps.flush().unwrap();
        assert!(dir.path().join(".kiln/timestamps").join(DATA_FILE).exists());

        let stamps = open(dir.path(), true);
        assert!(stamps.is_portable());
        let stamp = stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
        assert!(stamp.hash().is_some());
        stamps.flush().unwrap();
        assert!(dir.path().join(".kiln/hashes").join(DATA_FILE).exists());
    }

    #[test]
    fn recorded_file_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.java");
        std::fs::write(&file, "class A {}").unwrap();
        let stamps = open(dir.path(), false);
        stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
        assert!(stamps
            .current_stamp_if_up_to_date(&file, TargetId::new(1), None)
            .unwrap()
            .is_some());
        assert!(stamps
            .current_stamp_if_up_to_date(&file, TargetId::new(2), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn wipe_makes_everything_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.java");
        std::fs::write(&file, "class A {}").unwrap();
        let stamps = open(dir.path(), true);
        stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
        stamps.wipe().unwrap();
        assert!(stamps
            .current_stamp_if_up_to_date(&file, TargetId::new(1), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupted_store_requires_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.java");
        std::fs::write(&file, "class A {}").unwrap();
        {
            let stamps = open(dir.path(), false);
            stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
            stamps.close().unwrap();
            assert!(!stamps.full_rebuild_required());
        }
        std::fs::write(
            dir.path().join(".kiln/timestamps").join(DATA_FILE),
            b"garbage",
        )
        .unwrap();

        let stamps = open(dir.path(), false);
        assert!(stamps.full_rebuild_required());
        assert!(stamps
            .current_stamp_if_up_to_date(&file, TargetId::new(1), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn record_removed_forgets_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.java");
        std::fs::write(&file, "class A {}").unwrap();
        let stamps = open(dir.path(), false);
        stamps.record_compiled(&file, TargetId::new(1), None).unwrap();
        assert_eq!(stamps.tracked_files(TargetId::new(1)).unwrap(), vec![file.clone()]);
        stamps.record_removed(&file, TargetId::new(1)).unwrap();
        assert!(stamps.tracked_files(TargetId::new(1)).unwrap().is_empty());
        assert!(stamps.previous_stamp(&file, TargetId::new(1)).unwrap().is_none());
    }
}
