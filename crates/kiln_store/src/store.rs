//! The generic keyed store.
//!
//! Each [`KeyedStore`] owns one directory. Its contents live in memory behind
//! a single `RwLock` and are written to `<dir>/data.bin` on [`KeyedStore::force`].
//! Writes go through a temporary file and a rename, so the backing file always
//! holds either the previous snapshot or the new one.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::format;
use crate::owner::StorageOwner;

/// Name of the snapshot file within a store directory.
pub const DATA_FILE: &str = "data.bin";

/// Name of the in-progress snapshot file.
const TEMP_FILE: &str = "data.bin.tmp";

/// How [`KeyedStore::open_or_recreate`] obtained its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenStatus {
    /// No snapshot existed; the store starts empty.
    Created,
    /// An existing snapshot was loaded.
    Loaded,
    /// The snapshot was corrupted and has been deleted. Everything the store
    /// used to track must be considered dirty.
    Recreated {
        /// Why the previous snapshot was rejected.
        reason: String,
    },
}

impl OpenStatus {
    /// Returns `true` if previously persisted state was lost.
    pub fn lost_data(&self) -> bool {
        matches!(self, OpenStatus::Recreated { .. })
    }
}

struct State<K, V> {
    map: HashMap<K, V>,
    dirty: bool,
    closed: bool,
}

impl<K, V> State<K, V> {
    fn empty() -> Self {
        Self {
            map: HashMap::new(),
            dirty: false,
            closed: false,
        }
    }

    fn check_open(&self, dir: &Path) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed {
                path: dir.to_path_buf(),
            })
        } else {
            Ok(())
        }
    }
}

/// A durable `K -> V` map persisted under its own directory.
///
/// All operations are synchronous. Single-key reads and writes are atomic;
/// compound read-modify-write sequences must use [`compute`](Self::compute),
/// which runs under the store's write lock.
pub struct KeyedStore<K, V> {
    dir: PathBuf,
    state: RwLock<State<K, V>>,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Opens the store in `dir`.
    ///
    /// A missing snapshot yields an empty store. A snapshot that fails
    /// validation yields [`StoreError::Corrupted`].
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let (map, _) = Self::load(dir)?;
        Ok(Self::with_map(dir, map))
    }

    /// Opens the store in `dir`, recreating it empty if the snapshot is
    /// corrupted.
    ///
    /// Only I/O failures that prevent deleting the bad snapshot are returned
    /// as errors.
    pub fn open_or_recreate(dir: &Path) -> Result<(Self, OpenStatus), StoreError> {
        match Self::load(dir) {
            Ok((map, true)) => Ok((Self::with_map(dir, map), OpenStatus::Loaded)),
            Ok((map, false)) => Ok((Self::with_map(dir, map), OpenStatus::Created)),
            Err(StoreError::Corrupted { path, reason }) => {
                warn!(
                    "recreating corrupted store {}: {}",
                    path.display(),
                    reason
                );
                remove_backing_files(dir)?;
                Ok((
                    Self::with_map(dir, HashMap::new()),
                    OpenStatus::Recreated { reason },
                ))
            }
            Err(e) => Err(e),
        }
    }

    fn with_map(dir: &Path, map: HashMap<K, V>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(State {
                map,
                dirty: false,
                closed: false,
            }),
        }
    }

    /// Reads the snapshot. The flag is `false` when no snapshot existed.
    fn load(dir: &Path) -> Result<(HashMap<K, V>, bool), StoreError> {
        let path = dir.join(DATA_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((HashMap::new(), false));
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let entries: Vec<(K, V)> = format::decode(&raw, &path)?;
        debug!("loaded {} entries from {}", entries.len(), path.display());
        Ok((entries.into_iter().collect(), true))
    }

    /// Returns the directory this store owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a copy of the value stored for `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        let state = self.state.read();
        state.check_open(&self.dir)?;
        Ok(state.map.get(key).cloned())
    }

    /// Returns `true` if `key` has a value.
    pub fn contains(&self, key: &K) -> Result<bool, StoreError> {
        let state = self.state.read();
        state.check_open(&self.dir)?;
        Ok(state.map.contains_key(key))
    }

    /// Stores `value` for `key`, or removes `key` when `value` is `None`.
    pub fn update(&self, key: K, value: Option<V>) -> Result<(), StoreError> {
        match value {
            Some(value) => self.put(key, value),
            None => self.remove(&key).map(|_| ()),
        }
    }

    /// Stores `value` for `key`, replacing any previous value.
    pub fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.check_open(&self.dir)?;
        state.map.insert(key, value);
        state.dirty = true;
        Ok(())
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        let mut state = self.state.write();
        state.check_open(&self.dir)?;
        let old = state.map.remove(key);
        if old.is_some() {
            state.dirty = true;
        }
        Ok(old)
    }

    /// Atomically replaces the value for `key` with `f(old)`.
    ///
    /// Returning `None` from `f` removes the key. The new value is returned.
    pub fn compute<F>(&self, key: K, f: F) -> Result<Option<V>, StoreError>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let mut state = self.state.write();
        state.check_open(&self.dir)?;
        let old = state.map.remove(&key);
        let had_old = old.is_some();
        let new = f(old);
        match &new {
            Some(value) => {
                state.map.insert(key, value.clone());
                state.dirty = true;
            }
            None if had_old => state.dirty = true,
            None => {}
        }
        Ok(new)
    }

    /// Visits every entry under the write lock; entries for which `f`
    /// returns `false` are removed. Returns the number of removed entries.
    pub fn retain<F>(&self, mut f: F) -> Result<usize, StoreError>
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        let mut state = self.state.write();
        state.check_open(&self.dir)?;
        let before = state.map.len();
        state.map.retain(|k, v| f(k, v));
        let removed = before - state.map.len();
        // `f` may have mutated values in place, so the snapshot is stale either way.
        state.dirty = true;
        Ok(removed)
    }

    /// Visits every entry under the read lock.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&K, &V),
    {
        let state = self.state.read();
        state.check_open(&self.dir)?;
        for (k, v) in &state.map {
            f(k, v);
        }
        Ok(())
    }

    /// Returns every key currently in the store.
    pub fn all_keys(&self) -> Result<Vec<K>, StoreError> {
        let state = self.state.read();
        state.check_open(&self.dir)?;
        Ok(state.map.keys().cloned().collect())
    }

    /// Returns the number of entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let state = self.state.read();
        state.check_open(&self.dir)?;
        Ok(state.map.len())
    }

    /// Returns `true` if the store has no entries.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Returns `true` if there are changes not yet written by [`force`](Self::force).
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Returns `true` once the store has been closed or a wipe failed.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Writes the current contents to disk if anything changed.
    pub fn force(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.check_open(&self.dir)?;
        if !state.dirty {
            return Ok(());
        }
        let entries: Vec<(&K, &V)> = state.map.iter().collect();
        let bytes = format::encode(&entries)?;
        write_snapshot(&self.dir, &bytes)?;
        state.dirty = false;
        debug!("flushed {} entries to {}", state.map.len(), self.dir.display());
        Ok(())
    }

    /// Deletes all backing files and reopens the store empty.
    ///
    /// If the files cannot be deleted the store is left closed and every later
    /// operation fails with [`StoreError::Closed`].
    pub fn wipe(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        *state = State::empty();
        if let Err(e) = remove_backing_files(&self.dir) {
            state.closed = true;
            return Err(e);
        }
        debug!("wiped store {}", self.dir.display());
        Ok(())
    }

    /// Flushes pending changes and closes the store. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Ok(());
        }
        self.force()?;
        self.state.write().closed = true;
        Ok(())
    }
}

impl<K, V> StorageOwner for KeyedStore<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync,
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn flush(&self) -> Result<(), StoreError> {
        self.force()
    }

    fn clean(&self) -> Result<(), StoreError> {
        self.wipe()
    }

    fn close(&self) -> Result<(), StoreError> {
        KeyedStore::close(self)
    }
}

fn write_snapshot(dir: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let tmp = dir.join(TEMP_FILE);
    std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    let path = dir.join(DATA_FILE);
    std::fs::rename(&tmp, &path).map_err(|e| StoreError::io(path, e))
}

fn remove_backing_files(dir: &Path) -> Result<(), StoreError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}
