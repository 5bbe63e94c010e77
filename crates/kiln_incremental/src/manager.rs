//! High-level build data manager.
//!
//! The `BuildDataManager` ties together the target registry, the stamp
//! facade, the per-target source-to-output mappings, the output claim index
//! and the configuration snapshots into the single interface a build driver
//! uses before and after compiling each target.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_common::{normalize_path, ContentHash, ContentHasher, PathRelativizer, Xxh3Hasher};
use kiln_config::{load_config_or_default, ConfigError, StorageConfig};
use kiln_store::{OpenStatus, StorageOwner};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claims::OutputToTargetIndex;
use crate::error::IncrementalError;
use crate::facade::ProjectStamps;
use crate::fingerprint::ConfigurationStore;
use crate::hasher::{CancellationToken, ChangeSet, TargetHasher};
use crate::mapping::SourceToOutputMapping;
use crate::paths::{BuildDataPaths, VERSION_FILE};
use crate::stamp::{FileAttributes, Stamp};
use crate::target::{write_atomically, BuildTarget, TargetId, TargetRegistry};

/// Version of the on-disk layout as a whole. Bumped whenever any store
/// changes incompatibly.
pub const DATA_FORMAT_VERSION: u32 = 1;

/// Contents of `data-version.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DataVersion {
    format_version: u32,
    portable_caches: bool,
}

impl DataVersion {
    fn current(portable_caches: bool) -> Self {
        Self {
            format_version: DATA_FORMAT_VERSION,
            portable_caches,
        }
    }

    /// Loads the marker. Returns `None` if it is missing or unreadable.
    fn load(paths: &BuildDataPaths) -> Option<Self> {
        let path = paths.version_file();
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save(&self, paths: &BuildDataPaths) -> Result<(), IncrementalError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| IncrementalError::Serialization {
            reason: e.to_string(),
        })?;
        write_atomically(paths.root(), VERSION_FILE, &json)?;
        Ok(())
    }

    /// Returns `true` if data written under `self` can be read under `current`.
    fn is_compatible(&self, current: &DataVersion) -> bool {
        self == current
    }
}

/// Entry point for incremental build bookkeeping.
///
/// Every operation is safe to call from many threads at once. [`clean`] and
/// [`close`] wait for in-flight operations and block new ones until done.
///
/// [`clean`]: BuildDataManager::clean
/// [`close`]: BuildDataManager::close
pub struct BuildDataManager {
    paths: BuildDataPaths,
    portable: bool,
    relativizer: PathRelativizer,
    registry: TargetRegistry,
    stamps: ProjectStamps,
    claims: OutputToTargetIndex,
    mappings: Mutex<HashMap<TargetId, Arc<SourceToOutputMapping>>>,
    configurations: ConfigurationStore,
    target_hasher: TargetHasher,
    rebuild_required: AtomicBool,
    lifecycle: RwLock<()>,
}

impl BuildDataManager {
    /// Opens the build data of `project_dir` using the settings in its
    /// `kiln.toml`, or the defaults if there is none.
    pub fn open_project(project_dir: &Path) -> Result<Self, IncrementalError> {
        let config = load_config_or_default(project_dir)?;
        Self::open(project_dir, &config.storage)
    }

    /// Opens the build data of `project_dir` with XXH3 content hashing.
    pub fn open(project_dir: &Path, config: &StorageConfig) -> Result<Self, IncrementalError> {
        Self::open_with_hasher(project_dir, config, Arc::new(Xxh3Hasher))
    }

    /// Opens the build data of `project_dir` with a custom digest.
    ///
    /// Data written by an incompatible format version, or with a different
    /// `portable_caches` setting, is deleted and a full rebuild is flagged.
    /// So is a store that fails validation. Only the store directories and
    /// the format marker are ever deleted.
    ///
    /// Fails if the data root is `project_dir` itself.
    pub fn open_with_hasher(
        project_dir: &Path,
        config: &StorageConfig,
        hasher: Arc<dyn ContentHasher>,
    ) -> Result<Self, IncrementalError> {
        let data_root = config.data_root(project_dir);
        if normalize_path(&data_root) == normalize_path(project_dir) {
            return Err(ConfigError::Rejected {
                field: "storage.data_dir",
                reason: format!("{} is the project directory itself", data_root.display()),
            }
            .into());
        }
        let paths = BuildDataPaths::new(&data_root);
        let portable = config.portable_caches;
        let relativizer = if portable {
            PathRelativizer::portable(project_dir)
        } else {
            PathRelativizer::absolute()
        };

        let mut rebuild = prepare_root(&paths, portable)?;

        let registry = TargetRegistry::open(&paths.targets_dir());
        let stamps =
            ProjectStamps::open(&paths, portable, relativizer.clone(), Arc::clone(&hasher))?;
        let (claims, claims_status) = OutputToTargetIndex::open(
            &paths.output_targets_dir(),
            relativizer.clone(),
            Arc::clone(&hasher),
        )?;
        if let OpenStatus::Recreated { reason } = claims_status {
            warn!("output claims lost ({}), all targets will be rebuilt", reason);
            rebuild = true;
        }
        let (mappings, mappings_lost) = open_mappings(&paths, &relativizer)?;
        rebuild |= mappings_lost;
        let configurations = ConfigurationStore::new(&paths.configs_dir());
        let target_hasher = TargetHasher::new(config.worker_threads, hasher, relativizer.clone())?;

        info!(
            "opened build data at {} ({} targets, {})",
            paths.root().display(),
            registry.targets().len(),
            if portable { "content hashes" } else { "timestamps" }
        );

        Ok(Self {
            paths,
            portable,
            relativizer,
            registry,
            stamps,
            claims,
            mappings: Mutex::new(mappings),
            configurations,
            target_hasher,
            rebuild_required: AtomicBool::new(rebuild),
            lifecycle: RwLock::new(()),
        })
    }

    /// The on-disk layout.
    pub fn paths(&self) -> &BuildDataPaths {
        &self.paths
    }

    /// Returns `true` when files are stamped by content hash.
    pub fn is_portable(&self) -> bool {
        self.portable
    }

    /// Returns `true` if previously recorded data was lost since open, so
    /// every target must be rebuilt and its outputs regenerated.
    pub fn full_rebuild_required(&self) -> bool {
        self.rebuild_required.load(Ordering::SeqCst) || self.stamps.full_rebuild_required()
    }

    /// Returns the compact id of `target`, allocating one on first use.
    pub fn target_id(&self, target: &BuildTarget) -> TargetId {
        self.registry.get_or_allocate_id(target)
    }

    /// Returns `true` if `file` is unchanged since `target` last compiled it.
    ///
    /// Always `false` while [`full_rebuild_required`](Self::full_rebuild_required)
    /// holds.
    pub fn is_up_to_date(
        &self,
        target: &BuildTarget,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<bool, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        if self.full_rebuild_required() {
            return Ok(false);
        }
        Ok(self
            .stamps
            .current_stamp_if_up_to_date(file, id, attrs)?
            .is_some())
    }

    /// Computes the stamp `file` would get if recorded now.
    pub fn current_stamp(
        &self,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        let _guard = self.lifecycle.read();
        self.stamps.current_stamp(file, attrs)
    }

    /// Records `stamp` for `file`, e.g. one computed before compiling started.
    pub fn update_stamp(
        &self,
        target: &BuildTarget,
        file: &Path,
        stamp: Stamp,
    ) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        self.stamps.save_stamp(file, id, stamp)
    }

    /// Records that `target` compiled `file` successfully.
    pub fn record_compiled(
        &self,
        target: &BuildTarget,
        file: &Path,
        attrs: Option<&FileAttributes>,
    ) -> Result<Stamp, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        self.stamps.record_compiled(file, id, attrs)
    }

    /// Forgets the stamp of `file` for `target`.
    pub fn record_removed(&self, target: &BuildTarget, file: &Path) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        self.stamps.record_removed(file, id)
    }

    /// Replaces the outputs `target` produced from `source`.
    ///
    /// Returns the previously recorded outputs that are no longer produced
    /// by any source of `target` and that no other target claims; the caller
    /// should delete them.
    pub fn record_outputs(
        &self,
        target: &BuildTarget,
        source: &Path,
        outputs: &[PathBuf],
    ) -> Result<Vec<PathBuf>, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        let mapping = self.mapping(id)?;
        let previous = mapping.outputs(source)?.unwrap_or_default();
        mapping.set_outputs(source, outputs)?;
        self.claims.add_claims(outputs, id)?;

        let current: HashSet<String> = outputs
            .iter()
            .map(|o| self.relativizer.to_key(o))
            .collect();
        let stale: Vec<PathBuf> = previous
            .into_iter()
            .filter(|o| !current.contains(&self.relativizer.to_key(o)))
            .collect();
        self.release_orphaned(&mapping, &stale, id)
    }

    /// Adds one output of `source` without touching the others.
    pub fn append_output(
        &self,
        target: &BuildTarget,
        source: &Path,
        output: &Path,
    ) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        self.mapping(id)?.append_output(source, output)?;
        self.claims.add_claim(output, id)?;
        Ok(())
    }

    /// Returns the outputs `target` recorded for `source`.
    pub fn outputs(
        &self,
        target: &BuildTarget,
        source: &Path,
    ) -> Result<Vec<PathBuf>, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        Ok(self.mapping(id)?.outputs(source)?.unwrap_or_default())
    }

    /// Forgets a deleted source of `target`: its stamp, its mapping entry and
    /// the claims on its outputs.
    ///
    /// Returns the outputs that are now safe to delete.
    pub fn remove_source(
        &self,
        target: &BuildTarget,
        source: &Path,
    ) -> Result<Vec<PathBuf>, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        self.stamps.record_removed(source, id)?;
        let mapping = self.mapping(id)?;
        let outputs = mapping.remove(source)?;
        self.release_orphaned(&mapping, &outputs, id)
    }

    /// Drops the claims of `target` on `outputs` and returns those no other
    /// target claims.
    pub fn safe_to_delete(
        &self,
        outputs: &[PathBuf],
        target: &BuildTarget,
    ) -> Result<Vec<PathBuf>, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);
        Ok(self.claims.remove_claims_and_get_safe_to_delete(outputs, id)?)
    }

    /// Returns `true` if the configuration snapshot of `target` changed since
    /// it was last saved. A dirty target must be rebuilt in full.
    pub fn target_is_dirty<F>(&self, target: &BuildTarget, snapshot: F) -> bool
    where
        F: FnOnce() -> String,
    {
        let _guard = self.lifecycle.read();
        self.configurations.get(target).is_target_dirty(snapshot)
    }

    /// Persists the snapshot computed by the last
    /// [`target_is_dirty`](Self::target_is_dirty) for `target`.
    pub fn save_target_configuration(&self, target: &BuildTarget) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.read();
        self.configurations.get(target).save()?;
        Ok(())
    }

    /// Forgets `target` entirely.
    ///
    /// Returns every output it produced that no other target claims.
    pub fn remove_target(&self, target: &BuildTarget) -> Result<Vec<PathBuf>, IncrementalError> {
        let _guard = self.lifecycle.read();
        self.configurations.remove(target)?;
        let Some(id) = self.registry.target_id(target) else {
            return Ok(Vec::new());
        };

        let mapping = self.mapping(id)?;
        let outputs = mapping.all_outputs()?;
        let safe = self.claims.remove_claims_and_get_safe_to_delete(&outputs, id)?;
        let forgotten = self.stamps.remove_target(id)?;
        mapping.clean()?;
        self.mappings.lock().remove(&id);
        self.registry.remove_target(target);

        info!(
            "removed target {} ({} stamped files, {} deletable outputs)",
            target,
            forgotten,
            safe.len()
        );
        Ok(safe)
    }

    /// Classifies the current sources of `target` against its stamps.
    ///
    /// Files stamped for `target` but absent from `files` are reported as
    /// deleted. While a full rebuild is required, every stamped file is
    /// reported as modified.
    pub fn detect_changes(
        &self,
        target: &BuildTarget,
        files: &[PathBuf],
    ) -> Result<ChangeSet, IncrementalError> {
        let _guard = self.lifecycle.read();
        let id = self.registry.get_or_allocate_id(target);

        let mut changes = ChangeSet::default();
        let mut current = HashSet::with_capacity(files.len());
        let rebuild = self.full_rebuild_required();
        for file in files {
            current.insert(self.relativizer.to_key(file));
            if self.stamps.previous_stamp(file, id)?.is_none() {
                changes.new_files.push(file.clone());
            } else if !rebuild
                && self
                    .stamps
                    .current_stamp_if_up_to_date(file, id, None)?
                    .is_some()
            {
                changes.unchanged_files.push(file.clone());
            } else {
                changes.modified_files.push(file.clone());
            }
        }
        changes.deleted_files = self
            .stamps
            .tracked_files(id)?
            .into_iter()
            .filter(|file| !current.contains(&self.relativizer.to_key(file)))
            .collect();
        changes.sort();

        debug!(
            "{}: {} new, {} modified, {} deleted, {} unchanged",
            target,
            changes.new_files.len(),
            changes.modified_files.len(),
            changes.deleted_files.len(),
            changes.unchanged_files.len()
        );
        Ok(changes)
    }

    /// Computes one digest per target over its source files, in parallel.
    pub fn hash_targets(
        &self,
        targets: &[(BuildTarget, Vec<PathBuf>)],
        token: &CancellationToken,
    ) -> Result<Vec<(BuildTarget, ContentHash)>, IncrementalError> {
        let _guard = self.lifecycle.read();
        self.target_hasher.hash_targets(targets, token)
    }

    /// Writes all pending changes to disk.
    pub fn flush(&self) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.read();
        self.flush_all()
    }

    /// Deletes all build data. Every target is dirty afterwards.
    ///
    /// Files in the data root that no store owns are left alone.
    pub fn clean(&self) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.write();
        info!("cleaning build data at {}", self.paths.root().display());

        let mappings: Vec<_> = self.mappings.lock().drain().map(|(_, m)| m).collect();
        for mapping in mappings {
            mapping.clean()?;
        }
        self.registry.clean()?;
        self.stamps.clean()?;
        self.claims.clean()?;
        self.configurations.clean()?;
        discard_store_data(&self.paths)?;
        DataVersion::current(self.portable).save(&self.paths)?;
        self.rebuild_required.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes and closes every store. Later operations fail.
    pub fn close(&self) -> Result<(), IncrementalError> {
        let _guard = self.lifecycle.write();
        self.flush_all()?;
        let mappings: Vec<_> = self.mappings.lock().drain().map(|(_, m)| m).collect();
        for mapping in mappings {
            mapping.close()?;
        }
        self.registry.close()?;
        self.stamps.close()?;
        self.claims.close()?;
        self.configurations.close()?;
        debug!("closed build data at {}", self.paths.root().display());
        Ok(())
    }

    fn flush_all(&self) -> Result<(), IncrementalError> {
        self.registry.flush()?;
        self.stamps.flush()?;
        self.claims.flush()?;
        let mappings: Vec<_> = self.mappings.lock().values().cloned().collect();
        for mapping in mappings {
            mapping.flush()?;
        }
        Ok(())
    }

    /// Drops the claims of `id` on those of `outputs` that no remaining
    /// source in `mapping` still lists, and returns the ones now unclaimed.
    fn release_orphaned(
        &self,
        mapping: &SourceToOutputMapping,
        outputs: &[PathBuf],
        id: TargetId,
    ) -> Result<Vec<PathBuf>, IncrementalError> {
        let mut orphaned = Vec::with_capacity(outputs.len());
        for output in outputs {
            if !mapping.contains_output(output)? {
                orphaned.push(output.clone());
            }
        }
        Ok(self.claims.remove_claims_and_get_safe_to_delete(&orphaned, id)?)
    }

    fn mapping(&self, id: TargetId) -> Result<Arc<SourceToOutputMapping>, IncrementalError> {
        let mut mappings = self.mappings.lock();
        if let Some(mapping) = mappings.get(&id) {
            return Ok(Arc::clone(mapping));
        }
        let (mapping, status) =
            SourceToOutputMapping::open(&self.paths.mapping_dir(id), self.relativizer.clone())?;
        if let OpenStatus::Recreated { reason } = status {
            warn!(
                "outputs of target {} lost ({}), all targets will be rebuilt",
                id, reason
            );
            self.rebuild_required.store(true, Ordering::SeqCst);
        }
        let mapping = Arc::new(mapping);
        mappings.insert(id, Arc::clone(&mapping));
        Ok(mapping)
    }
}

/// Opens every per-target mapping already on disk so corruption is seen
/// before the first build step.
///
/// Returns the mappings and whether any of them had to be recreated.
fn open_mappings(
    paths: &BuildDataPaths,
    relativizer: &PathRelativizer,
) -> Result<(HashMap<TargetId, Arc<SourceToOutputMapping>>, bool), IncrementalError> {
    let mut mappings = HashMap::new();
    let mut lost = false;
    let dir = paths.mappings_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((mappings, lost)),
        Err(e) => return Err(IncrementalError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| IncrementalError::io(&dir, e))?;
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
            .map(TargetId::new)
        else {
            continue;
        };
        let (mapping, status) = SourceToOutputMapping::open(&entry.path(), relativizer.clone())?;
        if let OpenStatus::Recreated { reason } = status {
            warn!(
                "outputs of target {} lost ({}), all targets will be rebuilt",
                id, reason
            );
            lost = true;
        }
        mappings.insert(id, Arc::new(mapping));
    }
    debug!("opened {} output mappings", mappings.len());
    Ok((mappings, lost))
}

/// Checks the data format marker, discarding the stores if it is
/// incompatible.
///
/// Returns `true` if existing data was discarded.
fn prepare_root(paths: &BuildDataPaths, portable: bool) -> Result<bool, IncrementalError> {
    let current = DataVersion::current(portable);
    let discarded = match DataVersion::load(paths) {
        Some(found) if found.is_compatible(&current) => return Ok(false),
        Some(found) => {
            warn!(
                "build data at {} has format {} (portable: {}), expected {} (portable: {}); discarding",
                paths.root().display(),
                found.format_version,
                found.portable_caches,
                current.format_version,
                current.portable_caches
            );
            discard_store_data(paths)?;
            true
        }
        None if paths.store_dirs().iter().any(|dir| dir.exists()) => {
            warn!(
                "build data at {} has no readable format marker; discarding",
                paths.root().display()
            );
            discard_store_data(paths)?;
            true
        }
        None => false,
    };
    current.save(paths)?;
    Ok(discarded)
}

/// Deletes the store directories and the format marker, nothing else.
fn discard_store_data(paths: &BuildDataPaths) -> Result<(), IncrementalError> {
    for dir in paths.store_dirs() {
        remove_dir(&dir)?;
    }
    let marker = paths.version_file();
    match std::fs::remove_file(&marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IncrementalError::io(marker, e)),
    }
}

fn remove_dir(dir: &Path) -> Result<(), IncrementalError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IncrementalError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(portable: bool) -> StorageConfig {
        StorageConfig {
            portable_caches: portable,
            worker_threads: 2,
            ..StorageConfig::default()
        }
    }

    fn production(id: &str) -> BuildTarget {
        BuildTarget::new("java-production", id)
    }

    fn write(root: &Path, name: &str, content: &str) -> PathBuf {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Moves the modification time forward so same-millisecond rewrites are
    /// still seen as touched.
    fn touch_later(path: &Path) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10))
            .unwrap();
    }

    #[test]
    fn fresh_root_writes_version_marker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        assert!(!manager.full_rebuild_required());
        let marker = DataVersion::load(manager.paths()).unwrap();
        assert_eq!(marker, DataVersion::current(false));
    }

    #[test]
    fn switching_strategy_discards_data() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "src/A.java", "class A {}");
        {
            let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
            manager.record_compiled(&production("core"), &src, None).unwrap();
            manager.close().unwrap();
        }
        let manager = BuildDataManager::open(dir.path(), &config(true)).unwrap();
        assert!(manager.full_rebuild_required());
        assert!(!manager.paths().timestamps_dir().exists());
        assert!(!manager.is_up_to_date(&production("core"), &src, None).unwrap());
    }

    #[test]
    fn newer_format_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = BuildDataPaths::new(&config(false).data_root(dir.path()));
        std::fs::create_dir_all(paths.root()).unwrap();
        std::fs::write(
            paths.version_file(),
            r#"{"format_version": 99, "portable_caches": false}"#,
        )
        .unwrap();
        std::fs::create_dir_all(paths.hashes_dir()).unwrap();
        std::fs::write(paths.hashes_dir().join("leftover"), "x").unwrap();
        std::fs::write(paths.root().join("notes.txt"), "x").unwrap();

        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        assert!(manager.full_rebuild_required());
        assert!(!paths.hashes_dir().join("leftover").exists());
        assert!(paths.root().join("notes.txt").exists());
    }

    #[test]
    fn unmarked_root_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: "build".to_string(),
            ..config(false)
        };
        let readme = write(dir.path(), "build/README.txt", "hand written");
        let src = write(dir.path(), "src/A.java", "class A {}");

        let manager = BuildDataManager::open(dir.path(), &config).unwrap();
        assert!(!manager.full_rebuild_required());
        assert!(readme.exists());
        manager.record_compiled(&production("core"), &src, None).unwrap();
        manager.close().unwrap();

        let switched = StorageConfig {
            portable_caches: true,
            ..config
        };
        let manager = BuildDataManager::open(dir.path(), &switched).unwrap();
        assert!(manager.full_rebuild_required());
        assert!(!manager.paths().timestamps_dir().exists());
        assert_eq!(std::fs::read_to_string(&readme).unwrap(), "hand written");

        manager.clean().unwrap();
        assert!(readme.exists());
    }

    #[test]
    fn data_root_equal_to_project_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "src/A.java", "class A {}");
        for data_dir in [dir.path().to_string_lossy().into_owned(), ".".to_string()] {
            let config = StorageConfig {
                data_dir,
                ..config(false)
            };
            assert!(matches!(
                BuildDataManager::open(dir.path(), &config),
                Err(IncrementalError::Config(ConfigError::Rejected { .. }))
            ));
        }
        assert!(src.exists());
        assert!(!dir.path().join(VERSION_FILE).exists());
    }

    #[test]
    fn corrupted_mapping_is_seen_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let core = production("core");
        let src = write(dir.path(), "src/A.java", "class A {}");
        let data_file = {
            let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
            manager.record_compiled(&core, &src, None).unwrap();
            manager
                .record_outputs(&core, &src, &[dir.path().join("out/A.class")])
                .unwrap();
            let mapping_dir = manager.paths().mapping_dir(manager.target_id(&core));
            manager.close().unwrap();
            mapping_dir.join(kiln_store::DATA_FILE)
        };
        let mut bytes = std::fs::read(&data_file).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&data_file, bytes).unwrap();

        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        assert!(manager.full_rebuild_required());
        assert!(!manager.is_up_to_date(&core, &src, None).unwrap());
        assert_eq!(
            manager.detect_changes(&core, &[src.clone()]).unwrap().modified_files,
            vec![src]
        );
    }

    #[test]
    fn detect_changes_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "src/A.java", "class A {}");
        let b = write(dir.path(), "src/B.java", "class B {}");
        let gone = write(dir.path(), "src/Gone.java", "class Gone {}");
        let manager = BuildDataManager::open(dir.path(), &config(true)).unwrap();
        let core = production("core");
        for file in [&a, &b, &gone] {
            manager.record_compiled(&core, file, None).unwrap();
        }

        std::fs::write(&b, "class B { int x; }").unwrap();
        touch_later(&b);
        let c = write(dir.path(), "src/C.java", "class C {}");
        let changes = manager
            .detect_changes(&core, &[a.clone(), b.clone(), c.clone()])
            .unwrap();
        assert_eq!(changes.unchanged_files, vec![a]);
        assert_eq!(changes.modified_files, vec![b]);
        assert_eq!(changes.new_files, vec![c]);
        assert_eq!(changes.deleted_files, vec![gone]);
        assert_eq!(changes.dirty_count(), 2);
    }

    #[test]
    fn record_outputs_returns_dropped_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        let core = production("core");
        let src = dir.path().join("src/A.java");
        let a = dir.path().join("out/A.class");
        let inner = dir.path().join("out/A$Inner.class");

        let stale = manager
            .record_outputs(&core, &src, &[a.clone(), inner.clone()])
            .unwrap();
        assert!(stale.is_empty());

        let stale = manager.record_outputs(&core, &src, &[a.clone()]).unwrap();
        assert_eq!(stale, vec![inner]);
        assert_eq!(manager.outputs(&core, &src).unwrap(), vec![a]);
    }

    #[test]
    fn remove_source_releases_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        let core = production("core");
        let src = write(dir.path(), "src/A.java", "class A {}");
        let out = dir.path().join("out/A.class");
        manager.record_compiled(&core, &src, None).unwrap();
        manager.append_output(&core, &src, &out).unwrap();

        assert_eq!(manager.remove_source(&core, &src).unwrap(), vec![out]);
        assert!(manager.outputs(&core, &src).unwrap().is_empty());
        assert!(!manager.is_up_to_date(&core, &src, None).unwrap());
    }

    #[test]
    fn target_configuration_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let core = production("core");
        {
            let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
            assert!(manager.target_is_dirty(&core, || "-g".to_string()));
            manager.save_target_configuration(&core).unwrap();
            manager.close().unwrap();
        }
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        assert!(!manager.target_is_dirty(&core, || "-g".to_string()));
        assert!(manager.target_is_dirty(&core, || "-g -O".to_string()));
    }

    #[test]
    fn clean_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        let core = production("core");
        let src = write(dir.path(), "src/A.java", "class A {}");
        manager.record_compiled(&core, &src, None).unwrap();
        manager
            .record_outputs(&core, &src, &[dir.path().join("out/A.class")])
            .unwrap();
        manager.flush().unwrap();

        manager.clean().unwrap();
        assert!(!manager.is_up_to_date(&core, &src, None).unwrap());
        assert!(manager.outputs(&core, &src).unwrap().is_empty());
        assert!(manager.paths().version_file().exists());
        assert!(!manager.full_rebuild_required());
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BuildDataManager::open(dir.path(), &config(false)).unwrap();
        let src = write(dir.path(), "src/A.java", "class A {}");
        manager.close().unwrap();
        assert!(manager.record_compiled(&production("core"), &src, None).is_err());
    }

    #[test]
    fn open_project_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.toml"),
            "[storage]\ndata_dir = \"build-data\"\nportable_caches = true\n",
        )
        .unwrap();
        let manager = BuildDataManager::open_project(dir.path()).unwrap();
        assert!(manager.is_portable());
        assert_eq!(manager.paths().root(), dir.path().join("build-data"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kiln.toml"), "[storage\n").unwrap();
        assert!(matches!(
            BuildDataManager::open_project(dir.path()),
            Err(IncrementalError::Config(_))
        ));
    }
}
