//! Normalization of ephemeral search results.
//!
//! Raw results get a virtual id from their source span, later duplicates of
//! an id are dropped, and the survivors keep their original order.

use crate::{
    record::Fields, CacheSnapshot, IdOrigin, IdentityResolver, Record, RecordId, SearchSource,
    SOURCE_SPAN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A search result as the generator returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSearchItem {
    pub source: SearchSource,
    /// Position the generator assigned; the batch index is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
    pub fields: Fields,
}

impl RawSearchItem {
    pub fn new(source: SearchSource, fields: Fields) -> Self {
        Self {
            source,
            rank: None,
            fields,
        }
    }

    pub fn with_rank(mut self, rank: u64) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Recover the raw item behind a normalized search record.
    ///
    /// Returns `None` for ids outside every search span.
    pub fn from_record(record: &Record) -> Option<Self> {
        let source = SearchSource::of(record.id)?;
        Some(Self {
            source,
            rank: Some(record.id - source.offset()),
            fields: record.fields.clone(),
        })
    }
}

/// Result of normalizing one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// Deduplicated records in original order
    pub records: Vec<Record>,
    /// Items dropped because an earlier item had the same id
    pub duplicates: usize,
    /// Items whose position fell outside their source span
    pub out_of_range: usize,
    /// Items moved off an id held by a different cached record
    pub relocated: usize,
    /// Items identical to a record already cached under the same id
    pub already_present: usize,
}

impl NormalizedBatch {
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }
}

/// Assigns virtual ids to raw search results and removes duplicates.
#[derive(Debug, Clone, Copy)]
pub struct SearchDeduplicator<'a> {
    resolver: &'a IdentityResolver,
}

impl<'a> SearchDeduplicator<'a> {
    pub fn new(resolver: &'a IdentityResolver) -> Self {
        Self { resolver }
    }

    /// Normalize a batch with no cached records to avoid.
    ///
    /// Idempotent: normalizing the output again yields the same records.
    pub fn normalize(&self, raw: impl IntoIterator<Item = RawSearchItem>) -> NormalizedBatch {
        self.normalize_against(raw, &CacheSnapshot::new())
    }

    /// Normalize a batch so no emitted id collides with a record in `occupied`.
    ///
    /// An item whose id is held by an identical cached record is not emitted.
    /// An item whose id is held by a different record moves to the next free
    /// id in its source span.
    pub fn normalize_against(
        &self,
        raw: impl IntoIterator<Item = RawSearchItem>,
        occupied: &CacheSnapshot,
    ) -> NormalizedBatch {
        self.normalize_reserving(raw, occupied, &BTreeSet::new())
    }

    /// Like [`normalize_against`](Self::normalize_against), but ids in
    /// `reserved` are never emitted, whatever the cache holds.
    ///
    /// Used for ids of deleted records that are still tombstoned.
    pub fn normalize_reserving(
        &self,
        raw: impl IntoIterator<Item = RawSearchItem>,
        occupied: &CacheSnapshot,
        reserved: &BTreeSet<RecordId>,
    ) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        let mut natural = BTreeSet::new();
        let mut emitted = BTreeSet::new();

        for (index, item) in raw.into_iter().enumerate() {
            let origin = IdOrigin::SearchResult {
                source: item.source,
                position: item.rank.unwrap_or(index as u64),
            };
            let Ok(id) = self.resolver.assign_id(origin) else {
                batch.out_of_range += 1;
                continue;
            };
            if !natural.insert(id) {
                batch.duplicates += 1;
                continue;
            }

            let is_reserved = reserved.contains(&id);
            let id = match occupied.get(id) {
                Some(existing) if !is_reserved && existing.fields == item.fields => {
                    batch.already_present += 1;
                    continue;
                }
                None if !is_reserved && !emitted.contains(&id) => id,
                _ => match next_free(item.source, id, occupied, &emitted, reserved) {
                    Some(slot) => {
                        batch.relocated += 1;
                        slot
                    }
                    None => {
                        batch.out_of_range += 1;
                        continue;
                    }
                },
            };

            emitted.insert(id);
            batch.records.push(Record::ephemeral(id, item.fields));
        }

        batch
    }
}

fn next_free(
    source: SearchSource,
    taken: RecordId,
    occupied: &CacheSnapshot,
    emitted: &BTreeSet<RecordId>,
    reserved: &BTreeSet<RecordId>,
) -> Option<RecordId> {
    (taken + 1..source.offset() + SOURCE_SPAN).find(|slot| {
        !occupied.contains(*slot) && !emitted.contains(slot) && !reserved.contains(slot)
    })
}
