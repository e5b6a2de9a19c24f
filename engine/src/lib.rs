//! # grantsync engine
//!
//! The deterministic core of a client-side optimistic-mutation and
//! cache-reconciliation layer for server-owned collections (proposals,
//! reports, saved grants).
//!
//! This crate has no knowledge of timers, network or files. It decides
//! *what* the locally cached view should look like; the `grantsync-client`
//! crate decides *when* and talks to the outside world.
//!
//! ## Design Principles
//!
//! - **No IO**: persistence and remote calls live behind the client crate
//! - **Deterministic**: the same fetch over the same cache and tombstones
//!   always produces the same merged snapshot
//! - **Testable**: pure functions over plain data, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Identifiers
//!
//! Every [`Record`] has an integer [`RecordId`]. Ids below
//! [`VIRTUAL_ID_THRESHOLD`] are database-assigned ([`Namespace::Persisted`]);
//! ids at or above it are client-assigned ([`Namespace::Virtual`]) for
//! ephemeral search results and provisional creates. The
//! [`IdentityResolver`] is the only place that hands out virtual ids.
//!
//! ### Snapshots and tombstones
//!
//! A [`CacheSnapshot`] is the last known view of one collection. A
//! [`TombstoneSet`] records ids the user deleted; every merge consults it so
//! a stale read can never resurrect a deleted record.
//!
//! ### Mutations
//!
//! A [`MutationIntent`] captures the snapshot before an optimistic change.
//! [`MutationState`] is the per-mutation state machine and [`BatchOutcome`]
//! classifies per-id remote results into confirm / partial / total failure.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] merges a freshly fetched collection into a snapshot
//! under tombstone filtering, removing locally held records only after
//! their absence has been seen by consecutive fetches.
//!
//! ## Quick Start
//!
//! ```rust
//! use grantsync_engine::{
//!     AbsenceTracker, CacheSnapshot, Reconciler, Record, TombstonePruning, TombstoneSet,
//! };
//! use serde_json::json;
//!
//! let mut snapshot = CacheSnapshot::new();
//! let mut tombstones = TombstoneSet::new();
//! tombstones.add(&[2]);
//!
//! let fields = |title: &str| json!({ "title": title }).as_object().cloned().unwrap();
//! let fetched = vec![
//!     Record::persisted(1, fields("Arts council")),
//!     Record::persisted(2, fields("Deleted locally")),
//! ];
//!
//! let mut tracker = AbsenceTracker::new();
//! let report = Reconciler::new(&tombstones, &mut tracker, TombstonePruning::Never)
//!     .merge(&mut snapshot, fetched);
//!
//! assert_eq!(report.added, vec![1]);
//! assert_eq!(report.suppressed, vec![2]);
//! assert!(!snapshot.contains(2));
//! ```

pub mod clock;
pub mod collection;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod mutation;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod tombstone;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SyncTracker, SystemClock};
pub use collection::Collection;
pub use dedup::{NormalizedBatch, RawSearchItem, SearchDeduplicator};
pub use envelope::{parse_envelope, Envelope, EnvelopeError, RemoteError, RemoteErrorKind};
pub use error::Error;
pub use identity::{
    is_virtual, IdOrigin, IdentityResolver, Namespace, SearchSource, PROVISIONAL_OFFSET,
    SOURCE_SPAN, VIRTUAL_ID_THRESHOLD,
};
pub use mutation::{
    BatchOutcome, DeniedPolicy, MutationEvent, MutationIntent, MutationKind, MutationState,
    TargetOutcome,
};
pub use reconcile::{
    stale_targets, AbsenceTracker, MergeReport, ReconcilePlan, Reconciler, TombstonePruning,
};
pub use record::{Fields, Record, Residency, StoredRecord};
pub use snapshot::CacheSnapshot;
pub use tombstone::TombstoneSet;

/// Type aliases for clarity
pub type RecordId = u64;
pub type Version = u64;
pub type Timestamp = u64;
pub type MutationId = String;
