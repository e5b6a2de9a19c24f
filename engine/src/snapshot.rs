//! The cached view of one collection.
//!
//! Uses BTreeMap so iteration, rendering and serialization are
//! deterministic.

use crate::{error::Result, Error, Record, RecordId, TombstoneSet, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the server most recently told us, plus local optimistic changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    /// Records keyed by id
    pub items: BTreeMap<RecordId, Record>,
    /// Incremented on every write to the owning cache store
    pub version: Version,
}

impl CacheSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot at version 0 from records.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            items: records.into_iter().map(|r| (r.id, r)).collect(),
            version: 0,
        }
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.items.get_mut(&id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.items.contains_key(&id)
    }

    /// Insert or replace a record, returning the previous one.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.items.insert(record.id, record)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<Record> {
        self.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All ids currently held.
    pub fn ids(&self) -> BTreeSet<RecordId> {
        self.items.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.items.values()
    }

    /// The records the UI may show: everything not tombstoned.
    pub fn rendered<'a>(&'a self, tombstones: &'a TombstoneSet) -> Vec<&'a Record> {
        self.items
            .values()
            .filter(|r| !tombstones.contains(r.id))
            .collect()
    }

    /// Put `ids` back to how they were in `prior`.
    ///
    /// Ids present in `prior` are reinserted, ids absent from it are removed.
    pub fn restore_ids(&mut self, prior: &CacheSnapshot, ids: &[RecordId]) {
        for &id in ids {
            match prior.get(id) {
                Some(record) => {
                    self.items.insert(id, record.clone());
                }
                None => {
                    self.items.remove(&id);
                }
            }
        }
    }

    /// Replace every item with the items of `prior`. The version is kept.
    pub fn restore_all(&mut self, prior: &CacheSnapshot) {
        self.items = prior.items.clone();
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if let Some((key, record)) = snapshot.items.iter().find(|(k, r)| **k != r.id) {
            return Err(Error::InvalidSnapshot(format!(
                "item key {} does not match record id {}",
                key, record.id
            )));
        }

        Ok(snapshot)
    }
}
