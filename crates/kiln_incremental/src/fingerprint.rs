//! Target configuration fingerprints.
//!
//! A target's non-file settings (compiler flags, generated source roots and so
//! on) are serialized by the caller into an opaque string. If that string
//! differs from the one saved after the last successful build, the whole
//! target is dirty regardless of file stamps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_store::{StorageOwner, StoreError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::paths::safe_file_name;
use crate::target::{write_atomically, BuildTarget};

/// Extension of snapshot files.
const SNAPSHOT_EXT: &str = "cfg";

/// The saved and current configuration snapshot of one target.
pub struct TargetConfiguration {
    path: PathBuf,
    persisted: Mutex<Option<String>>,
    current: Mutex<Option<String>>,
}

impl TargetConfiguration {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    /// File holding the saved snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Computes the current snapshot and compares it with the saved one.
    ///
    /// The saved snapshot is loaded on first use; a missing or unreadable file
    /// counts as an empty snapshot. The computed snapshot is remembered for
    /// [`save`](Self::save).
    pub fn is_target_dirty<F>(&self, snapshot: F) -> bool
    where
        F: FnOnce() -> String,
    {
        let current = snapshot();
        let dirty = {
            let mut persisted = self.persisted.lock();
            let saved = persisted.get_or_insert_with(|| load_snapshot(&self.path));
            *saved != current
        };
        if dirty {
            debug!("configuration changed: {}", self.path.display());
        }
        *self.current.lock() = Some(current);
        dirty
    }

    /// Persists the snapshot computed by the last
    /// [`is_target_dirty`](Self::is_target_dirty) call.
    ///
    /// Does nothing if no snapshot was computed in this session.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(current) = self.current.lock().clone() else {
            return Ok(());
        };
        let (dir, name) = split_path(&self.path);
        write_atomically(dir, name, current.as_bytes())?;
        *self.persisted.lock() = Some(current);
        Ok(())
    }

    /// Deletes the saved snapshot so the target is dirty on the next check.
    pub fn invalidate(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        }
        *self.persisted.lock() = Some(String::new());
        Ok(())
    }
}

fn split_path(path: &Path) -> (&Path, &str) {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    (dir, name)
}

fn load_snapshot(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(
                "cannot read configuration snapshot {}: {}",
                path.display(),
                e
            );
            String::new()
        }
    }
}

/// Owns the snapshot files of all targets under one directory.
pub struct ConfigurationStore {
    dir: PathBuf,
    configurations: Mutex<HashMap<BuildTarget, Arc<TargetConfiguration>>>,
}

impl ConfigurationStore {
    /// Creates a store rooted at `dir`. Nothing is read until a target is
    /// first queried.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            configurations: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration tracker for `target`.
    pub fn get(&self, target: &BuildTarget) -> Arc<TargetConfiguration> {
        let mut configurations = self.configurations.lock();
        let config = configurations.entry(target.clone()).or_insert_with(|| {
            Arc::new(TargetConfiguration::new(self.snapshot_path(target)))
        });
        Arc::clone(config)
    }

    /// Forgets `target` and deletes its snapshot.
    pub fn remove(&self, target: &BuildTarget) -> Result<(), StoreError> {
        self.configurations.lock().remove(target);
        let path = self.snapshot_path(target);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    fn snapshot_path(&self, target: &BuildTarget) -> PathBuf {
        self.dir
            .join(safe_file_name(target.kind()))
            .join(format!("{}.{SNAPSHOT_EXT}", safe_file_name(target.id())))
    }
}

impl StorageOwner for ConfigurationStore {
    // Snapshots are written by `TargetConfiguration::save` after each
    // successful target build, never in bulk.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.configurations.lock().clear();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io {
                path: self.dir.clone(),
                source: e,
            }),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn target() -> BuildTarget {
        BuildTarget::new("java-production", "core")
    }

    #[test]
    fn first_check_is_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        assert!(store.get(&target()).is_target_dirty(|| "-g -source 17".to_string()));
    }

    #[test]
    fn saved_snapshot_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConfigurationStore::new(dir.path());
            let config = store.get(&target());
            config.is_target_dirty(|| "-g -source 17".to_string());
            config.save().unwrap();
        }
        let store = ConfigurationStore::new(dir.path());
        let config = store.get(&target());
        assert!(!config.is_target_dirty(|| "-g -source 17".to_string()));
        assert!(config.is_target_dirty(|| "-g -source 18".to_string()));
    }

    #[test]
    fn empty_snapshot_matches_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        assert!(!store.get(&target()).is_target_dirty(String::new));
    }

    #[test]
    fn save_without_check_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        let config = store.get(&target());
        config.save().unwrap();
        assert!(!config.path().exists());
    }

    #[test]
    fn invalidate_forces_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        let config = store.get(&target());
        config.is_target_dirty(|| "flags".to_string());
        config.save().unwrap();
        assert!(!config.is_target_dirty(|| "flags".to_string()));
        config.invalidate().unwrap();
        assert!(config.is_target_dirty(|| "flags".to_string()));
    }

    #[test]
    #[traced_test]
    fn unreadable_snapshot_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        let config = store.get(&target());
        // A directory where the file should be cannot be read as a string.
        std::fs::create_dir_all(config.path()).unwrap();
        assert!(config.is_target_dirty(|| "flags".to_string()));
        assert!(!config.is_target_dirty(String::new));
        assert!(logs_contain("cannot read configuration snapshot"));
    }

    #[test]
    fn targets_have_separate_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        let a = store.get(&target());
        let b = store.get(&BuildTarget::new("java-test", "core"));
        assert_ne!(a.path(), b.path());
        a.is_target_dirty(|| "a".to_string());
        a.save().unwrap();
        assert!(b.is_target_dirty(|| "a".to_string()));
    }

    #[test]
    fn remove_deletes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::new(dir.path());
        let config = store.get(&target());
        config.is_target_dirty(|| "a".to_string());
        config.save().unwrap();
        let path = config.path().to_path_buf();
        store.remove(&target()).unwrap();
        assert!(!path.exists());
    }
}
