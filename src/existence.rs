//! Filesystem existence cache
//!
//! Reconciles graph keys with the files actually present in the images
//! directory. Results are memoized until `invalidate_all`; a separate
//! missing-set remembers names confirmed absent so repeated lookups neither
//! rescan the directory nor warn again.
//!
//! The cache is owned by whoever creates it (normally the engine) and is
//! safe to share across threads. Filesystem access happens outside the
//! mutex; only map updates hold it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::paths::{is_unsafe_name, normalize_with_prefix, DEFAULT_PATH_PREFIX};

#[derive(Default)]
struct CacheState {
    /// key -> on-disk file name, `None` when absent
    known: HashMap<String, Option<String>>,
    /// keys confirmed absent
    missing: HashSet<String>,
}

pub struct ExistenceCache {
    images_dir: PathBuf,
    prefix: String,
    state: Mutex<CacheState>,
}

impl ExistenceCache {
    pub fn new<P: Into<PathBuf>>(images_dir: P) -> Self {
        Self::with_prefix(images_dir, DEFAULT_PATH_PREFIX)
    }

    pub fn with_prefix<P: Into<PathBuf>>(images_dir: P, prefix: &str) -> Self {
        Self {
            images_dir: images_dir.into(),
            prefix: prefix.to_string(),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Normalized key, or `None` when the name can never exist.
    fn key_for(&self, name: &str) -> Option<String> {
        let key = normalize_with_prefix(name, &self.prefix);
        if is_unsafe_name(&key) {
            None
        } else {
            Some(key)
        }
    }

    /// Cached existence check.
    pub fn exists(&self, name: &str) -> bool {
        self.exists_with(name, false)
    }

    /// Existence check; `force_refresh` bypasses the cached answer.
    pub fn exists_with(&self, name: &str, force_refresh: bool) -> bool {
        let Some(key) = self.key_for(name) else {
            return false;
        };
        if !force_refresh {
            if let Some(known) = self.state().known.get(&key) {
                return known.is_some();
            }
        }
        let located = self.locate(&key);
        let found = located.is_some();
        self.record(&key, located);
        found
    }

    /// Path of the file on disk for `name`, honoring case-insensitive matches.
    ///
    /// Answers come from the cache once a name has been checked, so repeated
    /// lookups stay off the filesystem until `invalidate_all`.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let key = self.key_for(name)?;
        let cached = self.state().known.get(&key).cloned();
        let located = match cached {
            Some(known) => known,
            None => {
                let located = self.locate(&key);
                self.record(&key, located.clone());
                located
            }
        };
        located.map(|real| self.images_dir.join(real))
    }

    /// True when `name` was checked and found absent since the last invalidation.
    pub fn is_known_missing(&self, name: &str) -> bool {
        match self.key_for(name) {
            Some(key) => self.state().missing.contains(&key),
            None => false,
        }
    }

    /// Forget everything. Call after any mutation of the graph.
    pub fn invalidate_all(&self) {
        let mut state = self.state();
        state.known.clear();
        state.missing.clear();
    }

    /// Number of cached existence answers
    pub fn len(&self) -> usize {
        self.state().known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the on-disk file name for `key`: exact match first, then a
    /// case-insensitive scan of the directory.
    fn locate(&self, key: &str) -> Option<String> {
        if self.images_dir.join(key).exists() {
            return Some(key.to_string());
        }

        let entries = match std::fs::read_dir(&self.images_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("cannot list {}: {}", self.images_dir.display(), e);
                return None;
            }
        };
        let wanted = key.to_lowercase();
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .find(|candidate| candidate.to_lowercase() == wanted)
            .map(|real| {
                tracing::debug!("case-insensitive match for {}: {}", key, real);
                real
            })
    }

    fn record(&self, key: &str, located: Option<String>) {
        let found = located.is_some();
        let mut state = self.state();
        state.known.insert(key.to_string(), located);
        if found {
            state.missing.remove(key);
        } else if state.missing.insert(key.to_string()) {
            tracing::warn!("Image not found: {}", key);
        }
    }
}

impl std::fmt::Debug for ExistenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExistenceCache")
            .field("images_dir", &self.images_dir)
            .field("entries", &self.len())
            .finish()
    }
}
