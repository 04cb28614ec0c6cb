//! LRU cache of decoded cell files.
//!
//! Keyed by file path, bounded by entry count, ordered by last access
//! where inserting counts as an access. The capacity stays at a few dozen
//! entries in practice, so eviction is a linear scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::feature::Feature;

pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// One cached cell. Freshly inserted entries are empty until their
/// creator fills them with [`append_all`](CellEntry::append_all).
#[derive(Default)]
pub struct CellEntry {
    features: RwLock<Arc<Vec<Feature>>>,
}

impl CellEntry {
    pub fn is_empty(&self) -> bool {
        self.features.read().unwrap().is_empty()
    }

    /// Append decoded features. Readers holding an older snapshot are
    /// unaffected.
    pub fn append_all(&self, features: Vec<Feature>) {
        let mut guard = self.features.write().unwrap();
        if guard.is_empty() {
            *guard = Arc::new(features);
        } else {
            let mut merged = Vec::with_capacity(guard.len() + features.len());
            merged.extend_from_slice(guard.as_slice());
            merged.extend(features);
            *guard = Arc::new(merged);
        }
    }

    /// Fill the entry only when it is still empty. Resolves the race
    /// between a reader that saw an empty entry and the creator that was
    /// still decoding it.
    pub fn fill_if_empty(&self, features: Vec<Feature>) {
        let mut guard = self.features.write().unwrap();
        if guard.is_empty() {
            *guard = Arc::new(features);
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Feature>> {
        Arc::clone(&self.features.read().unwrap())
    }
}

pub struct CellCache {
    capacity: usize,
    clock: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PathBuf, Arc<CellEntry>>,
    last_access: HashMap<PathBuf, u64>,
}

impl CellCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the entry for `path`, inserting an empty one when absent.
    /// The flag tells the caller whether it just created the entry and is
    /// therefore responsible for reading the file. Both hit and insert
    /// refresh the recency of the entry.
    pub fn get_or_insert(&self, path: &Path) -> (Arc<CellEntry>, bool) {
        let tick = self.tick();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(path) {
            let entry = Arc::clone(entry);
            inner.last_access.insert(path.to_path_buf(), tick);
            return (entry, false);
        }
        let entry = Arc::new(CellEntry::default());
        inner.entries.insert(path.to_path_buf(), Arc::clone(&entry));
        inner.last_access.insert(path.to_path_buf(), tick);
        if inner.entries.len() > self.capacity {
            evict_oldest(&mut inner);
        }
        (entry, true)
    }

    /// Plain hit: the entry if present, refreshing its recency.
    pub fn get(&self, path: &Path) -> Option<Arc<CellEntry>> {
        let tick = self.tick();
        let mut inner = self.inner.lock().unwrap();
        let entry = Arc::clone(inner.entries.get(path)?);
        inner.last_access.insert(path.to_path_buf(), tick);
        Some(entry)
    }

    /// Membership probe; does not refresh recency.
    pub fn has(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest(inner: &mut Inner) {
    let oldest = inner
        .last_access
        .iter()
        .min_by_key(|&(_, &tick)| tick)
        .map(|(path, _)| path.clone());
    if let Some(path) = oldest {
        inner.entries.remove(&path);
        inner.last_access.remove(&path);
    }
}
