//! Change detection and parallel per-target hashing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_common::{ContentHash, ContentHasher, PathRelativizer};
use rayon::prelude::*;
use tracing::debug;

use crate::error::IncrementalError;
use crate::target::BuildTarget;

/// Result of checking one target's current sources against its stamps.
///
/// Categorizes all files into new (never compiled for the target), modified
/// (stamp no longer matches), deleted (stamped but no longer a source), and
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Files without a stamp for the target.
    pub new_files: Vec<PathBuf>,

    /// Files whose stamp no longer matches.
    pub modified_files: Vec<PathBuf>,

    /// Stamped files that are no longer part of the target.
    pub deleted_files: Vec<PathBuf>,

    /// Files that are up to date.
    pub unchanged_files: Vec<PathBuf>,
}

impl ChangeSet {
    /// Returns `true` if there are no changes (no new, modified, or deleted files).
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.modified_files.is_empty() && self.deleted_files.is_empty()
    }

    /// Returns the number of files that must be recompiled (new + modified).
    pub fn dirty_count(&self) -> usize {
        self.new_files.len() + self.modified_files.len()
    }

    pub(crate) fn sort(&mut self) {
        self.new_files.sort();
        self.modified_files.sort();
        self.deleted_files.sort();
        self.unchanged_files.sort();
    }
}

/// Shared flag that asks long-running walks to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), IncrementalError> {
        if self.is_cancelled() {
            Err(IncrementalError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Marks a file that did not exist when the target was hashed.
const MISSING_FILE: u8 = 0;
const PRESENT_FILE: u8 = 1;

/// Computes one digest per target over all of its source files, one target
/// per worker.
pub struct TargetHasher {
    pool: rayon::ThreadPool,
    hasher: Arc<dyn ContentHasher>,
    relativizer: PathRelativizer,
}

impl TargetHasher {
    /// Starts a pool with `worker_threads` workers (`0` for the rayon
    /// default).
    pub fn new(
        worker_threads: usize,
        hasher: Arc<dyn ContentHasher>,
        relativizer: PathRelativizer,
    ) -> Result<Self, IncrementalError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("kiln-hash-{i}"))
            .build()
            .map_err(|e| IncrementalError::ThreadPool {
                reason: e.to_string(),
            })?;
        Ok(Self {
            pool,
            hasher,
            relativizer,
        })
    }

    /// Hashes the content of one file. A missing file yields `None`.
    pub fn hash_file(&self, file: &Path) -> Result<Option<ContentHash>, IncrementalError> {
        match std::fs::read(file) {
            Ok(content) => Ok(Some(self.hasher.hash(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IncrementalError::io(file, e)),
        }
    }

    /// Hashes the given files as one unit.
    ///
    /// The digest covers each file's key and content, in key order, so it
    /// does not depend on the order of `files`. The token is checked before
    /// every file.
    pub fn hash_target(
        &self,
        files: &[PathBuf],
        token: &CancellationToken,
    ) -> Result<ContentHash, IncrementalError> {
        let mut keyed: Vec<(String, &PathBuf)> = files
            .iter()
            .map(|file| (self.relativizer.to_key(file), file))
            .collect();
        keyed.sort();
        keyed.dedup_by(|a, b| a.0 == b.0);

        let mut digest = Vec::with_capacity(keyed.len() * 64);
        for (key, file) in keyed {
            token.check()?;
            digest.extend_from_slice(key.as_bytes());
            digest.push(b'\n');
            match self.hash_file(file)? {
                Some(hash) => {
                    digest.push(PRESENT_FILE);
                    digest.extend_from_slice(&hash.as_u64().to_le_bytes());
                }
                None => digest.push(MISSING_FILE),
            }
        }
        Ok(self.hasher.hash(&digest))
    }

    /// Hashes every target in parallel.
    ///
    /// Results are returned in input order. If the token is cancelled, or any
    /// file cannot be read, the whole call fails and no partial result is
    /// returned.
    pub fn hash_targets(
        &self,
        targets: &[(BuildTarget, Vec<PathBuf>)],
        token: &CancellationToken,
    ) -> Result<Vec<(BuildTarget, ContentHash)>, IncrementalError> {
        let hashes = self.pool.install(|| {
            targets
                .par_iter()
                .map(|(target, files)| {
                    let hash = self.hash_target(files, token)?;
                    Ok((target.clone(), hash))
                })
                .collect::<Result<Vec<_>, IncrementalError>>()
        })?;
        debug!("hashed {} targets", hashes.len());
        Ok(hashes)
    }
}
