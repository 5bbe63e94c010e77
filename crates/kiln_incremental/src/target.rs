//! Build targets and the persistent target id registry.
//!
//! Stores never key anything by the full `(kind, id)` pair of a target. They
//! use a compact [`TargetId`] allocated here, which stays stable across
//! process restarts.
//!
//! On disk the registry keeps one `targets.json` per target kind plus a
//! 4-byte marker holding the next free id:
//!
//! ```text
//! targets/
//!   free-target-id.dat
//!   java-production/targets.json
//!   java-test/targets.json
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use kiln_store::{StorageOwner, StoreError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::safe_file_name;

/// Name of the per-kind id table file.
const TABLE_FILE: &str = "targets.json";

/// Name of the free-id marker file.
const FREE_ID_FILE: &str = "free-target-id.dat";

/// Compact identifier of a build target inside the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(u32);

impl TargetId {
    /// Wraps a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical compilation unit, e.g. one module's production sources.
///
/// Identified externally by a kind (such as `java-production`) and an id that
/// is unique within that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTarget {
    kind: String,
    id: String,
}

impl BuildTarget {
    /// Creates a target from its kind and id.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// The target kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The id within the kind.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Serialized form of one kind's id table.
#[derive(Debug, Serialize, Deserialize)]
struct KindTableFile {
    kind: String,
    targets: Vec<(String, u32)>,
}

#[derive(Default)]
struct KindTable {
    ids: HashMap<String, TargetId>,
    dirty: bool,
}

/// Persistent `BuildTarget -> TargetId` mapping.
///
/// Ids are allocated from a single atomic counter. Each kind's table has its
/// own lock, so allocations for different kinds never contend.
pub struct TargetRegistry {
    dir: PathBuf,
    kinds: RwLock<HashMap<String, Arc<Mutex<KindTable>>>>,
    free_id: AtomicU32,
    marker_dirty: AtomicBool,
}

impl TargetRegistry {
    /// Loads the registry from `dir`.
    ///
    /// Unreadable tables and markers are logged and treated as empty; the
    /// affected targets receive fresh ids on their next lookup.
    pub fn open(dir: &Path) -> Self {
        let registry = Self {
            dir: dir.to_path_buf(),
            kinds: RwLock::new(HashMap::new()),
            free_id: AtomicU32::new(0),
            marker_dirty: AtomicBool::new(false),
        };
        registry.load();
        registry
    }

    fn load(&self) {
        if let Some(free_id) = read_free_id(&self.dir.join(FREE_ID_FILE)) {
            self.free_id.fetch_max(free_id, Ordering::SeqCst);
        }

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("cannot list target registry {}: {}", self.dir.display(), e);
                return;
            }
        };

        let mut kinds = self.kinds.write();
        for entry in entries.flatten() {
            let table_path = entry.path().join(TABLE_FILE);
            if !table_path.is_file() {
                continue;
            }
            let Some(file) = read_table(&table_path) else {
                continue;
            };
            let mut table = KindTable::default();
            for (id, raw) in file.targets {
                let target_id = TargetId::new(raw);
                self.mark_used(target_id);
                table.ids.insert(id, target_id);
            }
            debug!(
                "loaded {} targets of kind {}",
                table.ids.len(),
                file.kind
            );
            kinds.insert(file.kind, Arc::new(Mutex::new(table)));
        }
    }

    /// Returns the id for `target`, allocating one on first use.
    pub fn get_or_allocate_id(&self, target: &BuildTarget) -> TargetId {
        let table = self.kind_table(target.kind());
        let mut table = table.lock();
        if let Some(id) = table.ids.get(target.id()) {
            return *id;
        }
        let id = TargetId::new(self.free_id.fetch_add(1, Ordering::SeqCst));
        table.ids.insert(target.id().to_string(), id);
        table.dirty = true;
        self.marker_dirty.store(true, Ordering::SeqCst);
        debug!("allocated target id {} for {}", id, target);
        id
    }

    /// Returns the id for `target` without allocating.
    pub fn target_id(&self, target: &BuildTarget) -> Option<TargetId> {
        let kinds = self.kinds.read();
        let table = kinds.get(target.kind())?;
        let id = table.lock().ids.get(target.id()).copied();
        id
    }

    /// Records that `id` is in use so the counter never hands it out again.
    pub fn mark_used(&self, id: TargetId) {
        let candidate = id.as_u32().saturating_add(1);
        if self.free_id.fetch_max(candidate, Ordering::SeqCst) < candidate {
            self.marker_dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Removes `target` from the registry, returning its former id.
    ///
    /// The id is not handed out again by this registry.
    pub fn remove_target(&self, target: &BuildTarget) -> Option<TargetId> {
        let kinds = self.kinds.read();
        let table = kinds.get(target.kind())?;
        let mut table = table.lock();
        let removed = table.ids.remove(target.id());
        if removed.is_some() {
            table.dirty = true;
        }
        removed
    }

    /// Lists every registered target, sorted by id.
    pub fn targets(&self) -> Vec<(BuildTarget, TargetId)> {
        let kinds = self.kinds.read();
        let mut all: Vec<(BuildTarget, TargetId)> = kinds
            .iter()
            .flat_map(|(kind, table)| {
                table
                    .lock()
                    .ids
                    .iter()
                    .map(|(id, target_id)| (BuildTarget::new(kind.clone(), id.clone()), *target_id))
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|(_, id)| *id);
        all
    }

    /// Persists every changed kind table and the free-id marker.
    pub fn save(&self) -> Result<(), StoreError> {
        let kinds = self.kinds.read();
        for (kind, table) in kinds.iter() {
            let mut table = table.lock();
            if !table.dirty {
                continue;
            }
            let mut targets: Vec<(String, u32)> = table
                .ids
                .iter()
                .map(|(id, target_id)| (id.clone(), target_id.as_u32()))
                .collect();
            targets.sort();
            let file = KindTableFile {
                kind: kind.clone(),
                targets,
            };
            let json =
                serde_json::to_vec_pretty(&file).map_err(|e| StoreError::Serialization {
                    reason: e.to_string(),
                })?;
            let kind_dir = self.dir.join(safe_file_name(kind));
            write_atomically(&kind_dir, TABLE_FILE, &json)?;
            table.dirty = false;
        }

        if self.marker_dirty.swap(false, Ordering::SeqCst) {
            let free_id = self.free_id.load(Ordering::SeqCst);
            if let Err(e) = write_atomically(&self.dir, FREE_ID_FILE, &free_id.to_le_bytes()) {
                self.marker_dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    fn kind_table(&self, kind: &str) -> Arc<Mutex<KindTable>> {
        if let Some(table) = self.kinds.read().get(kind) {
            return Arc::clone(table);
        }
        let mut kinds = self.kinds.write();
        Arc::clone(kinds.entry(kind.to_string()).or_default())
    }
}

impl StorageOwner for TargetRegistry {
    fn flush(&self) -> Result<(), StoreError> {
        self.save()
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.kinds.write().clear();
        self.free_id.store(0, Ordering::SeqCst);
        self.marker_dirty.store(false, Ordering::SeqCst);
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
        self.save()
    }
}

fn read_table(path: &Path) -> Option<KindTableFile> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("cannot read target table {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&content) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(
                "ignoring unreadable target table {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

fn read_free_id(path: &Path) -> Option<u32> {
    match std::fs::read(path) {
        Ok(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
            Ok(raw) => Some(u32::from_le_bytes(raw)),
            Err(_) => {
                warn!("ignoring malformed target id marker {}", path.display());
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("cannot read target id marker {}: {}", path.display(), e);
            None
        }
    }
}

/// Writes `data` to `dir/name` through a temporary file and a rename.
pub(crate) fn write_atomically(dir: &Path, name: &str, data: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let tmp = dir.join(format!("{name}.tmp"));
    std::fs::write(&tmp, data).map_err(|e| StoreError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    let path = dir.join(name);
    std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io { path, source: e })
}
