//! Durable per-collection tombstone registry.
//!
//! Each collection's deleted ids persist under `tombstones:<collection>` as a
//! bare JSON array. The in-memory set is authoritative for the running
//! session; storage writes are best-effort and a failed write is logged, never
//! surfaced to the user.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use grantsync_engine::{Collection, RecordId, TombstoneSet};

/// Synchronous key-value storage for tombstone lists.
pub trait TombstoneStorage: Send + Sync {
    /// Read the raw value stored under `key`, if any.
    fn load(&self, key: &str) -> io::Result<Option<String>>;

    /// Replace the value stored under `key`.
    fn store(&self, key: &str, value: &str) -> io::Result<()>;
}

/// Stores each key as a JSON file inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `tombstones:proposals` becomes `<dir>/tombstones-proposals.json`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl TombstoneStorage for FileStorage {
    fn load(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, key: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)
    }
}

/// Process-local storage, with an optional failure switch for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw stored value, for inspection.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Seed a raw value.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }
}

impl TombstoneStorage for MemoryStorage {
    fn load(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.raw(key))
    }

    fn store(&self, key: &str, value: &str) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "storage unavailable"));
        }
        self.put_raw(key, value);
        Ok(())
    }
}

/// One collection's tombstones, mirrored to storage after every change.
pub struct TombstoneRegistry {
    collection: Collection,
    key: String,
    set: Mutex<TombstoneSet>,
    storage: Arc<dyn TombstoneStorage>,
}

impl TombstoneRegistry {
    /// Load the collection's tombstones from storage.
    ///
    /// Missing, unreadable or malformed data starts an empty set.
    pub fn open(collection: Collection, storage: Arc<dyn TombstoneStorage>) -> Self {
        let key = collection.tombstone_key();

        let set = match storage.load(&key) {
            Ok(Some(raw)) => match TombstoneSet::from_json(&raw) {
                Ok(set) => set,
                Err(e) => {
                    tracing::warn!(%collection, error = %e, "Discarding malformed tombstones");
                    TombstoneSet::new()
                }
            },
            Ok(None) => TombstoneSet::new(),
            Err(e) => {
                tracing::warn!(%collection, error = %e, "Failed to read tombstones");
                TombstoneSet::new()
            }
        };

        tracing::debug!(%collection, count = set.len(), "Tombstones loaded");

        Self {
            collection,
            key,
            set: Mutex::new(set),
            storage,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.lock().contains(id)
    }

    pub fn all(&self) -> BTreeSet<RecordId> {
        self.lock().all()
    }

    /// A copy of the current set.
    pub fn snapshot(&self) -> TombstoneSet {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tombstone `ids`. Returns how many were new.
    pub(crate) fn add(&self, ids: &[RecordId]) -> usize {
        let mut set = self.lock();
        let added = set.add(ids);
        if added > 0 {
            self.persist(&set);
        }
        added
    }

    /// Clear tombstones for `ids`. Returns how many were present.
    pub(crate) fn remove(&self, ids: &[RecordId]) -> usize {
        let mut set = self.lock();
        let removed = set.remove(ids);
        if removed > 0 {
            self.persist(&set);
        }
        removed
    }

    fn persist(&self, set: &TombstoneSet) {
        let result = set
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .and_then(|json| self.storage.store(&self.key, &json));

        if let Err(e) = result {
            tracing::warn!(
                collection = %self.collection,
                error = %e,
                "Failed to persist tombstones; keeping them in memory"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, TombstoneSet> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TombstoneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TombstoneRegistry")
            .field("collection", &self.collection)
            .field("count", &self.len())
            .finish()
    }
}
