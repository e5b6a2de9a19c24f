//! Per-collection cache store.
//!
//! The store is the only place a collection's [`CacheSnapshot`] lives. Every
//! write bumps the snapshot version and notifies subscribers, so a view
//! re-renders exactly once per atomic update.

use std::sync::{Mutex, MutexGuard};

use grantsync_engine::{CacheSnapshot, Collection, Record, TombstoneSet, Version};
use tokio::sync::watch;

/// Receiver that yields the latest snapshot version after every write.
pub type RenderReceiver = watch::Receiver<Version>;

/// Holds one collection's snapshot.
///
/// Reads are public. Writes are crate-private: only the mutation coordinator
/// and the reconciliation scheduler may change the cache.
#[derive(Debug)]
pub struct CacheStore {
    collection: Collection,
    snapshot: Mutex<CacheSnapshot>,
    renders: watch::Sender<Version>,
}

impl CacheStore {
    pub fn new(collection: Collection) -> Self {
        let (renders, _) = watch::channel(0);
        Self {
            collection,
            snapshot: Mutex::new(CacheSnapshot::new()),
            renders,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// A copy of the current snapshot.
    pub fn read(&self) -> CacheSnapshot {
        self.lock().clone()
    }

    pub fn version(&self) -> Version {
        self.lock().version
    }

    /// Records visible to the user given the current tombstones.
    pub fn rendered(&self, tombstones: &TombstoneSet) -> Vec<Record> {
        self.lock()
            .rendered(tombstones)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Subscribe to re-render notifications.
    pub fn subscribe(&self) -> RenderReceiver {
        self.renders.subscribe()
    }

    /// Replace the snapshot wholesale.
    #[allow(dead_code)]
    pub(crate) fn write(&self, next: CacheSnapshot) {
        self.modify(|snapshot| snapshot.items = next.items)
    }

    /// Apply a pure transformation to the snapshot.
    pub(crate) fn update(&self, f: impl FnOnce(&CacheSnapshot) -> CacheSnapshot) {
        self.modify(|snapshot| {
            let next = f(snapshot);
            snapshot.items = next.items;
        })
    }

    /// Mutate the snapshot in place, always publishing a new version.
    pub(crate) fn modify<R>(&self, f: impl FnOnce(&mut CacheSnapshot) -> R) -> R {
        self.modify_if(|snapshot| (f(snapshot), true))
    }

    /// Mutate the snapshot in place, publishing only when `f` reports a change.
    pub(crate) fn modify_if<R>(&self, f: impl FnOnce(&mut CacheSnapshot) -> (R, bool)) -> R {
        let mut snapshot = self.lock();
        let (result, changed) = f(&mut snapshot);
        if changed {
            snapshot.version += 1;
            let version = snapshot.version;
            drop(snapshot);
            self.renders.send_replace(version);
            tracing::trace!(collection = %self.collection, version, "Cache updated");
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, CacheSnapshot> {
        // A panicked writer leaves a complete snapshot behind.
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
