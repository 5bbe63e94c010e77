//! Per-target source-to-output mapping.

use std::path::{Path, PathBuf};

use kiln_common::PathRelativizer;
use kiln_store::{KeyedStore, OpenStatus, StorageOwner, StoreError};

/// Records which outputs each source of one target produced.
///
/// Output lists are kept sorted and free of duplicates. A source with no
/// outputs has no entry.
pub struct SourceToOutputMapping {
    store: KeyedStore<String, Vec<String>>,
    relativizer: PathRelativizer,
}

impl SourceToOutputMapping {
    /// Opens the mapping in `dir`, recreating it if corrupted.
    pub fn open(
        dir: &Path,
        relativizer: PathRelativizer,
    ) -> Result<(Self, OpenStatus), StoreError> {
        let (store, status) = KeyedStore::open_or_recreate(dir)?;
        Ok((Self { store, relativizer }, status))
    }

    /// Replaces the full output set of `source`.
    pub fn set_outputs(&self, source: &Path, outputs: &[PathBuf]) -> Result<(), StoreError> {
        let mut keys: Vec<String> = outputs
            .iter()
            .map(|output| self.relativizer.to_key(output))
            .collect();
        keys.sort();
        keys.dedup();
        let value = (!keys.is_empty()).then_some(keys);
        self.store.update(self.relativizer.to_key(source), value)
    }

    /// Adds one output of `source`, keeping the others.
    pub fn append_output(&self, source: &Path, output: &Path) -> Result<(), StoreError> {
        let output = self.relativizer.to_key(output);
        self.store
            .compute(self.relativizer.to_key(source), |old| {
                let mut outputs = old.unwrap_or_default();
                if let Err(index) = outputs.binary_search(&output) {
                    outputs.insert(index, output);
                }
                Some(outputs)
            })?;
        Ok(())
    }

    /// Removes `source` and all its outputs from the mapping.
    ///
    /// Returns the outputs that were recorded.
    pub fn remove(&self, source: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let old = self.store.remove(&self.relativizer.to_key(source))?;
        Ok(self.to_paths(old.unwrap_or_default()))
    }

    /// Removes a single `source -> output` association.
    pub fn remove_output(&self, source: &Path, output: &Path) -> Result<(), StoreError> {
        let output = self.relativizer.to_key(output);
        self.store
            .compute(self.relativizer.to_key(source), |old| {
                let mut outputs = old?;
                outputs.retain(|o| *o != output);
                (!outputs.is_empty()).then_some(outputs)
            })?;
        Ok(())
    }

    /// Returns the outputs recorded for `source`.
    pub fn outputs(&self, source: &Path) -> Result<Option<Vec<PathBuf>>, StoreError> {
        let outputs = self.store.get(&self.relativizer.to_key(source))?;
        Ok(outputs.map(|o| self.to_paths(o)))
    }

    /// Returns `true` if any source still lists `output`.
    pub fn contains_output(&self, output: &Path) -> Result<bool, StoreError> {
        let output = self.relativizer.to_key(output);
        let mut found = false;
        self.store.for_each(|_, outputs| {
            found = found || outputs.binary_search(&output).is_ok();
        })?;
        Ok(found)
    }

    /// Returns every source with recorded outputs, sorted.
    pub fn sources(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut keys = self.store.all_keys()?;
        keys.sort();
        Ok(self.to_paths(keys))
    }

    /// Returns every output of every source, sorted and deduplicated.
    pub fn all_outputs(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut keys = Vec::new();
        self.store
            .for_each(|_, outputs| keys.extend(outputs.iter().cloned()))?;
        keys.sort();
        keys.dedup();
        Ok(self.to_paths(keys))
    }

    fn to_paths(&self, keys: Vec<String>) -> Vec<PathBuf> {
        keys.iter().map(|k| self.relativizer.to_path(k)).collect()
    }
}

impl StorageOwner for SourceToOutputMapping {
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
