//! Output-to-target claim index.
//!
//! Two targets may write the same output path (for example when they share an
//! output directory). Before a target's cleanup deletes an output it must
//! drop its own claim; the file is only deleted when no other target still
//! claims it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{ContentHash, ContentHasher, PathRelativizer};
use kiln_store::{KeyedStore, OpenStatus, StorageOwner, StoreError};
use tracing::debug;

use crate::target::TargetId;

/// Maps a hash of each normalized output path to the targets producing it.
pub struct OutputToTargetIndex {
    store: KeyedStore<ContentHash, Vec<TargetId>>,
    relativizer: PathRelativizer,
    hasher: Arc<dyn ContentHasher>,
}

impl OutputToTargetIndex {
    /// Opens the index in `dir`, recreating it if corrupted.
    pub fn open(
        dir: &Path,
        relativizer: PathRelativizer,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<(Self, OpenStatus), StoreError> {
        let (store, status) = KeyedStore::open_or_recreate(dir)?;
        Ok((
            Self {
                store,
                relativizer,
                hasher,
            },
            status,
        ))
    }

    fn key(&self, output: &Path) -> ContentHash {
        self.hasher.hash(self.relativizer.to_key(output).as_bytes())
    }

    /// Records that `target` produces `output`.
    pub fn add_claim(&self, output: &Path, target: TargetId) -> Result<(), StoreError> {
        self.store.compute(self.key(output), |old| {
            let mut targets = old.unwrap_or_default();
            if !targets.contains(&target) {
                targets.push(target);
            }
            Some(targets)
        })?;
        Ok(())
    }

    /// Records that `target` produces every path in `outputs`.
    pub fn add_claims(&self, outputs: &[PathBuf], target: TargetId) -> Result<(), StoreError> {
        for output in outputs {
            self.add_claim(output, target)?;
        }
        Ok(())
    }

    /// Drops the claim of `target` on `output`.
    ///
    /// Returns `true` if no target claims `output` afterwards.
    pub fn remove_claim(&self, output: &Path, target: TargetId) -> Result<bool, StoreError> {
        let remaining = self.store.compute(self.key(output), |old| {
            let mut targets = old?;
            targets.retain(|t| *t != target);
            (!targets.is_empty()).then_some(targets)
        })?;
        Ok(remaining.is_none())
    }

    /// Returns the targets claiming `output`.
    pub fn claims(&self, output: &Path) -> Result<Vec<TargetId>, StoreError> {
        Ok(self.store.get(&self.key(output))?.unwrap_or_default())
    }

    /// Drops the claims of `target` on `outputs` and returns the outputs that
    /// no target claims any more.
    ///
    /// An output with no recorded claims at all is reported as safe to delete:
    /// a stale artifact is worse than an unnecessary rebuild.
    pub fn remove_claims_and_get_safe_to_delete(
        &self,
        outputs: &[PathBuf],
        target: TargetId,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut safe = Vec::new();
        for output in outputs {
            let mut unclaimed = false;
            self.store.compute(self.key(output), |old| {
                let Some(mut targets) = old else {
                    debug!(
                        "no claims recorded for {}, treating as deletable",
                        output.display()
                    );
                    unclaimed = true;
                    return None;
                };
                targets.retain(|t| *t != target);
                if targets.is_empty() {
                    unclaimed = true;
                    None
                } else {
                    Some(targets)
                }
            })?;
            if unclaimed {
                safe.push(output.clone());
            }
        }
        Ok(safe)
    }
}

impl StorageOwner for OutputToTargetIndex {
    fn flush(&self) -> Result<(), StoreError> {
        self.store.force()
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.store.wipe()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::Xxh3Hasher;

    fn make_index() -> (tempfile::TempDir, OutputToTargetIndex) {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = OutputToTargetIndex::open(
            &dir.path().join("output-targets"),
            PathRelativizer::absolute(),
            Arc::new(Xxh3Hasher),
        )
        .unwrap();
        (dir, index)
    }

    #[test]
    fn shared_output_survives_first_removal() {
        let (_dir, index) = make_index();
        let out = PathBuf::from("/p/out/A.class");
        let t1 = TargetId::new(3);
        let t2 = TargetId::new(7);
        index.add_claim(&out, t1).unwrap();
        index.add_claim(&out, t2).unwrap();

        let safe = index
            .remove_claims_and_get_safe_to_delete(&[out.clone()], t1)
            .unwrap();
        assert!(safe.is_empty());
        assert_eq!(index.claims(&out).unwrap(), vec![t2]);

        let safe = index
            .remove_claims_and_get_safe_to_delete(&[out.clone()], t2)
            .unwrap();
        assert_eq!(safe, vec![out.clone()]);
        assert!(index.claims(&out).unwrap().is_empty());
    }

    #[test]
    fn unknown_output_is_safe_to_delete() {
        let (_dir, index) = make_index();
        let out = PathBuf::from("/p/out/Orphan.class");
        let safe = index
            .remove_claims_and_get_safe_to_delete(&[out.clone()], TargetId::new(1))
            .unwrap();
        assert_eq!(safe, vec![out]);
    }

    #[test]
    fn foreign_claim_is_not_removed() {
        let (_dir, index) = make_index();
        let out = PathBuf::from("/p/out/A.class");
        index.add_claim(&out, TargetId::new(7)).unwrap();
        let safe = index
            .remove_claims_and_get_safe_to_delete(&[out.clone()], TargetId::new(3))
            .unwrap();
        assert!(safe.is_empty());
        assert_eq!(index.claims(&out).unwrap(), vec![TargetId::new(7)]);
    }

    #[test]
    fn claims_are_deduplicated() {
        let (_dir, index) = make_index();
        let out = PathBuf::from("/p/out/A.class");
        index
            .add_claims(&[out.clone(), out.clone()], TargetId::new(1))
            .unwrap();
        assert_eq!(index.claims(&out).unwrap(), vec![TargetId::new(1)]);
    }

    #[test]
    fn remove_claim_reports_unclaimed() {
        let (_dir, index) = make_index();
        let out = PathBuf::from("/p/out/A.class");
        index.add_claim(&out, TargetId::new(1)).unwrap();
        index.add_claim(&out, TargetId::new(2)).unwrap();
        assert!(!index.remove_claim(&out, TargetId::new(1)).unwrap());
        assert!(index.remove_claim(&out, TargetId::new(2)).unwrap());
    }

    #[test]
    fn equivalent_paths_share_a_key() {
        let (_dir, index) = make_index();
        index
            .add_claim(Path::new("/p/out/./A.class"), TargetId::new(1))
            .unwrap();
        assert_eq!(
            index.claims(Path::new("/p/out/x/../A.class")).unwrap(),
            vec![TargetId::new(1)]
        );
    }
}
