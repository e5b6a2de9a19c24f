//! Optimistic mutations with per-target rollback.
//!
//! Every mutation follows the same shape:
//!
//! 1. Capture a [`MutationIntent`] holding the prior snapshot
//! 2. Apply the change to the cache (and tombstones, for deletes) at once
//! 3. Issue one remote call per target, concurrently
//! 4. Classify the results and restore whatever failed
//! 5. Emit notices and schedule reconciliation

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use futures::future::join_all;
use grantsync_engine::{
    BatchOutcome, Clock, Collection, DeniedPolicy, Fields, IdOrigin, IdentityResolver,
    MutationEvent, MutationId, MutationIntent, MutationKind, MutationState, Record, RecordId,
    RemoteError, RemoteErrorKind, Residency, StoredRecord, TargetOutcome,
};
use tokio::task::JoinHandle;

use crate::cache::CacheStore;
use crate::error::{ClientError, Result};
use crate::notice::{Notice, NoticeSink};
use crate::scheduler::{ReconciliationScheduler, RunOutcome};
use crate::service::{DeleteTarget, RecordStoreService, SaveRequest};
use crate::tombstones::TombstoneRegistry;

/// Resolver shared by every collection of a session.
pub type SharedResolver = Arc<Mutex<IdentityResolver>>;

/// How a mutation settled.
#[derive(Debug)]
pub struct MutationReport {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    /// Terminal state, or `Idle` when there was nothing to do
    pub state: MutationState,
    pub outcome: BatchOutcome,
    pub notices: Vec<Notice>,
    /// The record the server returned, for creates, updates and saves
    pub record: Option<Record>,
    /// The reconciliation run scheduled for this mutation
    pub reconciliation: Option<JoinHandle<RunOutcome>>,
}

/// Applies mutations to one collection.
pub struct MutationCoordinator {
    collection: Collection,
    cache: Arc<CacheStore>,
    tombstones: Arc<TombstoneRegistry>,
    service: Arc<dyn RecordStoreService>,
    scheduler: Arc<ReconciliationScheduler>,
    resolver: SharedResolver,
    clock: Arc<dyn Clock>,
    notices: NoticeSink,
    denied_policy: DeniedPolicy,
    /// Provisional ids of creates in flight, flagged once the user deletes them
    pending_creates: DashMap<RecordId, bool>,
}

impl MutationCoordinator {
    pub fn new(
        scheduler: Arc<ReconciliationScheduler>,
        resolver: SharedResolver,
        clock: Arc<dyn Clock>,
        notices: NoticeSink,
        denied_policy: DeniedPolicy,
    ) -> Self {
        Self {
            collection: scheduler.collection(),
            cache: Arc::clone(scheduler.cache()),
            tombstones: Arc::clone(scheduler.tombstones()),
            service: Arc::clone(scheduler.service()),
            scheduler,
            resolver,
            clock,
            notices,
            denied_policy,
            pending_creates: DashMap::new(),
        }
    }

    /// Delete a batch of records.
    ///
    /// Targets leave the cache and are tombstoned before any remote call.
    /// Each target gets its own delete; a not-found answer counts as success.
    /// Only failed targets are restored, and only their tombstones cleared.
    /// Provisional ids never reach the server: deleting one cancels its
    /// create, which removes the server row once it exists.
    pub async fn delete(&self, ids: &[RecordId]) -> Result<MutationReport> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if !targets.contains(id) {
                targets.push(*id);
            }
        }

        let intent = self.capture(MutationKind::Delete, targets);
        if intent.target_ids.is_empty() {
            return Ok(self.nothing_to_do(intent));
        }

        let (drafts, rows): (Vec<RecordId>, Vec<RecordId>) = intent
            .target_ids
            .iter()
            .copied()
            .partition(|id| IdentityResolver::is_provisional(*id));
        for id in &drafts {
            if let Some(mut cancelled) = self.pending_creates.get_mut(id) {
                *cancelled = true;
                tracing::debug!(collection = %self.collection, id, "Cancelling create in flight");
            }
        }

        let newly_tombstoned: Vec<RecordId> = rows
            .iter()
            .copied()
            .filter(|id| !self.tombstones.contains(*id))
            .collect();

        self.tombstones.add(&rows);
        self.cache.modify(|snapshot| {
            for id in &intent.target_ids {
                snapshot.remove(*id);
            }
        });
        let mut state = self.advance(&intent, MutationState::Idle, MutationEvent::Apply)?;

        let service = &self.service;
        let collection = self.collection;
        let calls = intent.target_ids.iter().map(move |&id| async move {
            if IdentityResolver::is_provisional(id) {
                return (id, TargetOutcome::Succeeded);
            }
            let result = service
                .delete(collection, DeleteTarget::for_id(id))
                .await
                .into_result()
                .map(|_| ());
            (id, TargetOutcome::from_delete(result))
        });
        state = self.advance(&intent, state, MutationEvent::Issue)?;
        let outcomes = join_all(calls).await;

        let reason = first_error(outcomes.iter().map(|(_, outcome)| outcome));
        for (id, outcome) in &outcomes {
            log_target(self.collection, &intent.id, *id, outcome);
        }

        let outcome = BatchOutcome::classify(outcomes, self.denied_policy);
        state = self.advance(&intent, state, outcome.event())?;

        match state {
            MutationState::PartialFailure => {
                let rollback = outcome.rollback_ids();
                self.cache
                    .modify(|snapshot| snapshot.restore_ids(&intent.prior_snapshot, rollback));
                self.clear_tombstones(rollback, &newly_tombstoned);
                state = self.advance(&intent, state, MutationEvent::RolledBack)?;
            }
            MutationState::TotalFailure => {
                self.cache.modify(|snapshot| {
                    snapshot.restore_ids(&intent.prior_snapshot, &intent.target_ids)
                });
                self.clear_tombstones(&intent.target_ids, &newly_tombstoned);
                state = self.advance(&intent, state, MutationEvent::RolledBack)?;
            }
            _ => {}
        }

        let mut notices = Vec::new();
        let restored = outcome.rollback_ids().len();
        match state {
            MutationState::Confirmed if !outcome.succeeded.is_empty() => {
                notices.push(Notice::Success {
                    collection: self.collection,
                    kind: MutationKind::Delete,
                    count: outcome.succeeded.len(),
                });
            }
            MutationState::RolledBackPartial => notices.push(Notice::PartialSuccess {
                collection: self.collection,
                kind: MutationKind::Delete,
                succeeded: outcome.total() - restored,
                failed: restored,
            }),
            MutationState::RolledBackFull => notices.push(Notice::Failure {
                collection: self.collection,
                kind: MutationKind::Delete,
                failed: restored,
                reason: reason.unwrap_or_else(|| "delete failed".to_string()),
            }),
            _ => {}
        }
        if !outcome.denied.is_empty() {
            notices.push(Notice::PermissionDenied {
                collection: self.collection,
                ids: outcome.denied.clone(),
            });
        }

        Ok(self.finish(intent, state, outcome, notices, None))
    }

    /// Create a record.
    ///
    /// The record appears at once under a provisional id, which is swapped
    /// for the server's id on success.
    pub async fn create(&self, fields: Fields) -> Result<MutationReport> {
        let provisional = self.lock_resolver().next_provisional()?;
        let intent = self.capture(MutationKind::Create, vec![provisional]);

        self.cache.modify(|snapshot| {
            snapshot.insert(Record::pending(provisional, fields.clone()));
        });
        let state = self.advance(&intent, MutationState::Idle, MutationEvent::Apply)?;
        let state = self.advance(&intent, state, MutationEvent::Issue)?;

        self.pending_creates.insert(provisional, false);
        let result = self
            .service
            .create(self.collection, fields)
            .await
            .into_data()
            .and_then(|row| self.accept_created(row));

        let cancelled = self
            .pending_creates
            .remove(&provisional)
            .is_some_and(|(_, cancelled)| cancelled);
        if cancelled {
            return self.settle_cancelled_create(intent, state, provisional, result).await;
        }
        self.settle_write(intent, state, provisional, None, result)
    }

    /// Replace a persisted record's fields.
    pub async fn update(&self, id: RecordId, fields: Fields) -> Result<MutationReport> {
        let existing = self
            .cache
            .read()
            .get(id)
            .cloned()
            .ok_or(ClientError::NotCached(id))?;
        if existing.is_virtual() {
            return Err(ClientError::SnapshotImmutable(id));
        }

        let intent = self.capture(MutationKind::Update, vec![id]);
        self.cache.update(|current| {
            let mut next = current.clone();
            if let Some(record) = next.get_mut(id) {
                record.fields = fields.clone();
            }
            next
        });
        let state = self.advance(&intent, MutationState::Idle, MutationEvent::Apply)?;
        let state = self.advance(&intent, state, MutationEvent::Issue)?;

        let result = self
            .service
            .update(self.collection, id, fields)
            .await
            .into_data()
            .and_then(into_record);

        self.settle_write(intent, state, id, Some(id), result)
    }

    /// Save a record into this collection.
    ///
    /// Persisted records are saved by reference, virtual ones with their
    /// snapshot. Saving clears a tombstone left by an earlier unsave.
    pub async fn save(&self, record: &Record) -> Result<MutationReport> {
        let id = record.id;
        let request = SaveRequest::for_record(record);
        let was_tombstoned = self.tombstones.contains(id);

        let intent = self.capture(MutationKind::Create, vec![id]);

        let mut optimistic = if record.is_virtual() {
            Record::from_snapshot(id, record.snapshot_blob())
        } else {
            Record::persisted(id, record.fields.clone())
        };
        optimistic.residency = Residency::Pending;
        self.cache.modify(|snapshot| {
            snapshot.insert(optimistic);
        });
        if was_tombstoned {
            self.tombstones.remove(&[id]);
        }
        let state = self.advance(&intent, MutationState::Idle, MutationEvent::Apply)?;
        let state = self.advance(&intent, state, MutationEvent::Issue)?;

        let result = self
            .service
            .save(self.collection, request)
            .await
            .into_data()
            .and_then(into_record);

        if result.is_err() && was_tombstoned {
            self.tombstones.add(&[id]);
        }
        self.settle_write(intent, state, id, Some(id), result)
    }

    /// Finish a single-target write: swap in the server copy or roll back.
    fn settle_write(
        &self,
        intent: MutationIntent,
        state: MutationState,
        local_id: RecordId,
        target: Option<RecordId>,
        result: std::result::Result<Record, RemoteError>,
    ) -> Result<MutationReport> {
        let target_outcome = TargetOutcome::from_write(&result);
        log_target(self.collection, &intent.id, local_id, &target_outcome);

        // A refused write has nothing worth keeping locally.
        let outcome = BatchOutcome::classify([(local_id, target_outcome)], DeniedPolicy::Rollback);
        let mut state = self.advance(&intent, state, outcome.event())?;

        let mut notices = Vec::new();
        let record = match result {
            Ok(record) => {
                self.cache.modify(|snapshot| {
                    snapshot.remove(local_id);
                    snapshot.insert(record.clone());
                });
                self.tombstones.remove(&[record.id]);
                notices.push(Notice::Success {
                    collection: self.collection,
                    kind: intent.kind,
                    count: 1,
                });
                Some(record)
            }
            Err(e) => {
                self.cache.modify(|snapshot| {
                    snapshot.restore_ids(&intent.prior_snapshot, &[local_id])
                });
                state = self.advance(&intent, state, MutationEvent::RolledBack)?;
                notices.push(match (e.kind, target) {
                    (RemoteErrorKind::PermissionDenied, Some(id)) => Notice::PermissionDenied {
                        collection: self.collection,
                        ids: vec![id],
                    },
                    _ => Notice::Failure {
                        collection: self.collection,
                        kind: intent.kind,
                        failed: 1,
                        reason: e.message,
                    },
                });
                None
            }
        };

        Ok(self.finish(intent, state, outcome, notices, record))
    }

    /// Finish a create the user deleted while it was in flight.
    ///
    /// The optimistic record is already gone. A row the server did create is
    /// tombstoned and deleted in turn; if that delete fails the row is shown.
    async fn settle_cancelled_create(
        &self,
        intent: MutationIntent,
        state: MutationState,
        provisional: RecordId,
        result: std::result::Result<Record, RemoteError>,
    ) -> Result<MutationReport> {
        let target_outcome = TargetOutcome::from_write(&result);
        log_target(self.collection, &intent.id, provisional, &target_outcome);

        let outcome = BatchOutcome::classify([(provisional, target_outcome)], DeniedPolicy::Rollback);
        let mut state = self.advance(&intent, state, outcome.event())?;

        let record = match result {
            Ok(record) => record,
            Err(_) => {
                state = self.advance(&intent, state, MutationEvent::RolledBack)?;
                return Ok(self.finish(intent, state, outcome, Vec::new(), None));
            }
        };

        self.tombstones.add(&[record.id]);
        let deleted = self
            .service
            .delete(self.collection, DeleteTarget::for_id(record.id))
            .await
            .into_result()
            .map(|_| ());
        let follow_up = TargetOutcome::from_delete(deleted);
        log_target(self.collection, &intent.id, record.id, &follow_up);

        let mut notices = Vec::new();
        match follow_up {
            TargetOutcome::Succeeded | TargetOutcome::AlreadyAbsent => {
                tracing::info!(
                    collection = %self.collection,
                    mutation_id = %intent.id,
                    id = record.id,
                    "Removed row of cancelled create"
                );
            }
            TargetOutcome::Failed(e) | TargetOutcome::Denied(e) => {
                self.tombstones.remove(&[record.id]);
                self.cache.modify(|snapshot| {
                    snapshot.insert(record.clone());
                });
                notices.push(Notice::Failure {
                    collection: self.collection,
                    kind: MutationKind::Delete,
                    failed: 1,
                    reason: e.message,
                });
            }
        }

        Ok(self.finish(intent, state, outcome, notices, Some(record)))
    }

    fn finish(
        &self,
        intent: MutationIntent,
        state: MutationState,
        outcome: BatchOutcome,
        notices: Vec<Notice>,
        record: Option<Record>,
    ) -> MutationReport {
        for notice in &notices {
            self.notices.emit(notice.clone());
        }

        tracing::info!(
            collection = %self.collection,
            mutation_id = %intent.id,
            kind = %intent.kind,
            state = %state,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            denied = outcome.denied.len(),
            "Mutation settled"
        );

        let reconciliation = Some(self.scheduler.schedule(&intent));

        MutationReport {
            mutation_id: intent.id,
            kind: intent.kind,
            state,
            outcome,
            notices,
            record,
            reconciliation,
        }
    }

    fn nothing_to_do(&self, intent: MutationIntent) -> MutationReport {
        tracing::debug!(collection = %self.collection, kind = %intent.kind, "Empty mutation ignored");
        MutationReport {
            mutation_id: intent.id,
            kind: intent.kind,
            state: MutationState::Idle,
            outcome: BatchOutcome::default(),
            notices: Vec::new(),
            record: None,
            reconciliation: None,
        }
    }

    fn capture(&self, kind: MutationKind, targets: Vec<RecordId>) -> MutationIntent {
        MutationIntent::capture(
            uuid::Uuid::new_v4().to_string(),
            kind,
            self.collection,
            targets,
            &self.cache.read(),
            self.clock.now_ms(),
        )
    }

    fn advance(
        &self,
        intent: &MutationIntent,
        state: MutationState,
        event: MutationEvent,
    ) -> Result<MutationState> {
        let next = state.on(event)?;
        tracing::debug!(
            collection = %self.collection,
            mutation_id = %intent.id,
            from = %state,
            to = %next,
            "Mutation transition"
        );
        Ok(next)
    }

    /// Clear tombstones for `ids` that this mutation introduced.
    fn clear_tombstones(&self, ids: &[RecordId], introduced: &[RecordId]) {
        let clear: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| introduced.contains(id))
            .collect();
        self.tombstones.remove(&clear);
    }

    /// A created row must carry a server-assigned persisted id.
    fn accept_created(&self, row: StoredRecord) -> std::result::Result<Record, RemoteError> {
        self.lock_resolver()
            .assign_id(IdOrigin::Persisted(row.id))
            .map_err(|e| RemoteError::rejected(e.to_string()))?;
        into_record(row)
    }

    fn lock_resolver(&self) -> MutexGuard<'_, IdentityResolver> {
        self.resolver.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("collection", &self.collection)
            .field("denied_policy", &self.denied_policy)
            .finish()
    }
}

fn into_record(row: StoredRecord) -> std::result::Result<Record, RemoteError> {
    row.into_record()
        .map_err(|e| RemoteError::rejected(e.to_string()))
}

fn first_error<'a>(outcomes: impl Iterator<Item = &'a TargetOutcome>) -> Option<String> {
    outcomes.into_iter().find_map(|outcome| match outcome {
        TargetOutcome::Failed(e) | TargetOutcome::Denied(e) => Some(e.message.clone()),
        TargetOutcome::Succeeded | TargetOutcome::AlreadyAbsent => None,
    })
}

fn log_target(collection: Collection, mutation_id: &str, id: RecordId, outcome: &TargetOutcome) {
    match outcome {
        TargetOutcome::Succeeded => {
            tracing::debug!(%collection, mutation_id, id, "Remote call succeeded")
        }
        TargetOutcome::AlreadyAbsent => {
            tracing::debug!(%collection, mutation_id, id, "Target already absent on server")
        }
        TargetOutcome::Denied(e) => {
            tracing::warn!(%collection, mutation_id, id, error = %e, "Remote call denied")
        }
        TargetOutcome::Failed(e) => {
            tracing::warn!(%collection, mutation_id, id, error = %e, "Remote call failed")
        }
    }
}
