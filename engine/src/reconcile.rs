//! Merging fetched collections into the cache.
//!
//! # Algorithm
//!
//! 1. Drop every fetched record whose id is tombstoned
//! 2. Insert fetched records, replacing the local copy when it differs
//! 3. Count consecutive fetches in which a durable local record is missing;
//!    remove it once the absence has been seen twice in a row
//! 4. Count the same for tombstoned ids and, when pruning is enabled,
//!    report them as safe to clear
//!
//! Pending creates and ephemeral search results are never removed for
//! absence: the server has no row for them yet.

use crate::{CacheSnapshot, Record, RecordId, TombstoneSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Delays used after creates, updates and saves.
pub const DEFAULT_CREATE_DELAYS_MS: [u64; 5] = [50, 300, 800, 1_500, 3_000];

/// Delays used after deletes.
pub const DEFAULT_DELETE_DELAYS_MS: [u64; 4] = [100, 500, 1_000, 2_000];

/// A bounded sequence of re-fetch delays.
///
/// Each delay is measured from the previous attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub delays_ms: Vec<u64>,
}

impl ReconcilePlan {
    pub fn from_millis(delays_ms: impl Into<Vec<u64>>) -> Self {
        Self {
            delays_ms: delays_ms.into(),
        }
    }

    pub fn for_create() -> Self {
        Self::from_millis(DEFAULT_CREATE_DELAYS_MS)
    }

    pub fn for_delete() -> Self {
        Self::from_millis(DEFAULT_DELETE_DELAYS_MS)
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    pub fn attempts(&self) -> usize {
        self.delays_ms.len()
    }

    /// Sum of all delays.
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.delays_ms.iter().sum())
    }
}

/// Whether confirmed-absent tombstones may be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TombstonePruning {
    /// Tombstones are kept for the life of the registry.
    Never,
    /// A tombstone is cleared once its id is absent from consecutive fetches.
    #[default]
    ConfirmedAbsence,
}

/// Consecutive-absence counts per id, kept across fetches.
#[derive(Debug, Clone, Default)]
pub struct AbsenceTracker {
    misses: BTreeMap<RecordId, u32>,
}

impl AbsenceTracker {
    /// Successful fetches an id must be missing from before it counts as gone.
    pub const CONFIRMATIONS: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&mut self, id: RecordId) {
        self.misses.remove(&id);
    }

    /// Record a miss; true once the absence is confirmed.
    fn missed(&mut self, id: RecordId) -> bool {
        let count = self.misses.entry(id).or_insert(0);
        *count = count.saturating_add(1);
        *count >= Self::CONFIRMATIONS
    }

    fn forget(&mut self, id: RecordId) {
        self.misses.remove(&id);
    }

    /// Current miss count for `id`.
    pub fn misses(&self, id: RecordId) -> u32 {
        self.misses.get(&id).copied().unwrap_or(0)
    }

    fn retain(&mut self, keep: impl Fn(RecordId) -> bool) {
        self.misses.retain(|id, _| keep(*id));
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Fetched ids that were not cached before
    pub added: Vec<RecordId>,
    /// Cached ids replaced by a different fetched copy
    pub refreshed: Vec<RecordId>,
    /// Cached ids removed after confirmed absence, tombstoned or not
    pub removed: Vec<RecordId>,
    /// Fetched ids hidden because they are tombstoned
    pub suppressed: Vec<RecordId>,
    /// Tombstoned ids confirmed gone on the server
    pub prunable: Vec<RecordId>,
    /// Every id the fetch returned, tombstoned or not
    pub remote_ids: BTreeSet<RecordId>,
}

impl MergeReport {
    /// Whether the snapshot's items changed.
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.refreshed.is_empty() && self.removed.is_empty())
    }
}

/// Merges fetched records into a snapshot.
pub struct Reconciler<'a> {
    tombstones: &'a TombstoneSet,
    tracker: &'a mut AbsenceTracker,
    pruning: TombstonePruning,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        tombstones: &'a TombstoneSet,
        tracker: &'a mut AbsenceTracker,
        pruning: TombstonePruning,
    ) -> Self {
        Self {
            tombstones,
            tracker,
            pruning,
        }
    }

    /// Merge one successful fetch of the full collection.
    pub fn merge(self, snapshot: &mut CacheSnapshot, fetched: Vec<Record>) -> MergeReport {
        let mut report = MergeReport {
            remote_ids: fetched.iter().map(|r| r.id).collect(),
            ..MergeReport::default()
        };

        for record in fetched {
            let id = record.id;
            self.tracker.seen(id);

            if self.tombstones.contains(id) {
                snapshot.remove(id);
                report.suppressed.push(id);
                continue;
            }

            let differs = snapshot.get(id).map(|existing| *existing != record);
            match differs {
                Some(false) => {}
                Some(true) => {
                    snapshot.insert(record);
                    report.refreshed.push(id);
                }
                None => {
                    snapshot.insert(record);
                    report.added.push(id);
                }
            }
        }

        let missing: Vec<RecordId> = snapshot
            .records()
            .filter(|r| {
                r.is_durable()
                    && !report.remote_ids.contains(&r.id)
                    && !self.tombstones.contains(r.id)
            })
            .map(|r| r.id)
            .collect();
        for id in missing {
            if self.tracker.missed(id) {
                snapshot.remove(id);
                self.tracker.forget(id);
                report.removed.push(id);
            }
        }

        for id in self.tombstones.iter() {
            if report.remote_ids.contains(&id) {
                continue;
            }
            if self.tracker.missed(id) && self.pruning == TombstonePruning::ConfirmedAbsence {
                self.tracker.forget(id);
                // Once the tombstone goes, a cached copy would render again.
                if snapshot.remove(id).is_some() {
                    report.removed.push(id);
                }
                report.prunable.push(id);
            }
        }

        let tombstones = self.tombstones;
        self.tracker
            .retain(|id| snapshot.contains(id) || tombstones.contains(id));

        report
    }
}

/// Delete targets the server still returns.
pub fn stale_targets(targets: &[RecordId], remote_ids: &BTreeSet<RecordId>) -> Vec<RecordId> {
    targets
        .iter()
        .copied()
        .filter(|id| remote_ids.contains(id))
        .collect()
}
