//! Mutation intents and the per-mutation state machine.
//!
//! ```text
//! Idle -> OptimisticApplied -> RemoteInFlight -> Confirmed
//!                                    |-> PartialFailure -> RolledBackPartial
//!                                    |-> TotalFailure   -> RolledBackFull
//! ```

use crate::{
    error::Result, CacheSnapshot, Collection, Error, MutationId, RecordId, RemoteError,
    RemoteErrorKind, Timestamp,
};
use serde::{Deserialize, Serialize};

/// What a mutation does to its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation as captured before its optimistic application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationIntent {
    pub id: MutationId,
    pub kind: MutationKind,
    pub collection: Collection,
    pub target_ids: Vec<RecordId>,
    /// Cache contents before the optimistic write
    pub prior_snapshot: CacheSnapshot,
    pub issued_at: Timestamp,
}

impl MutationIntent {
    /// Capture an intent against the current snapshot.
    pub fn capture(
        id: impl Into<MutationId>,
        kind: MutationKind,
        collection: Collection,
        target_ids: Vec<RecordId>,
        prior: &CacheSnapshot,
        issued_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            collection,
            target_ids,
            prior_snapshot: prior.clone(),
            issued_at,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == MutationKind::Delete
    }
}

/// Lifecycle of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Idle,
    OptimisticApplied,
    RemoteInFlight,
    Confirmed,
    PartialFailure,
    TotalFailure,
    RolledBackPartial,
    RolledBackFull,
}

/// Inputs that advance a [`MutationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    /// The optimistic write landed in the cache.
    Apply,
    /// Remote calls were issued.
    Issue,
    AllSucceeded,
    SomeFailed,
    AllFailed,
    /// The cache and tombstones were restored for the failed targets.
    RolledBack,
}

impl MutationState {
    /// Advance by one event, rejecting transitions the lifecycle forbids.
    pub fn on(self, event: MutationEvent) -> Result<MutationState> {
        use MutationEvent as E;
        use MutationState as S;

        match (self, event) {
            (S::Idle, E::Apply) => Ok(S::OptimisticApplied),
            (S::OptimisticApplied, E::Issue) => Ok(S::RemoteInFlight),
            (S::RemoteInFlight, E::AllSucceeded) => Ok(S::Confirmed),
            (S::RemoteInFlight, E::SomeFailed) => Ok(S::PartialFailure),
            (S::RemoteInFlight, E::AllFailed) => Ok(S::TotalFailure),
            (S::PartialFailure, E::RolledBack) => Ok(S::RolledBackPartial),
            (S::TotalFailure, E::RolledBack) => Ok(S::RolledBackFull),
            (from, event) => Err(Error::IllegalTransition {
                from: from.to_string(),
                event: format!("{event:?}").to_lowercase(),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MutationState::Confirmed | MutationState::RolledBackPartial | MutationState::RolledBackFull
        )
    }
}

impl std::fmt::Display for MutationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MutationState::Idle => "idle",
            MutationState::OptimisticApplied => "optimistic_applied",
            MutationState::RemoteInFlight => "remote_in_flight",
            MutationState::Confirmed => "confirmed",
            MutationState::PartialFailure => "partial_failure",
            MutationState::TotalFailure => "total_failure",
            MutationState::RolledBackPartial => "rolled_back_partial",
            MutationState::RolledBackFull => "rolled_back_full",
        };
        f.write_str(name)
    }
}

/// What to do locally when the server denies a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeniedPolicy {
    /// Leave the record removed and tombstoned.
    #[default]
    KeepOptimistic,
    /// Treat the denial like any other failure and restore the record.
    Rollback,
}

/// Remote result for a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Succeeded,
    /// The server had nothing to delete.
    AlreadyAbsent,
    Denied(RemoteError),
    Failed(RemoteError),
}

impl TargetOutcome {
    /// Classify a delete result. Not-found counts as success.
    pub fn from_delete(result: std::result::Result<(), RemoteError>) -> Self {
        match result {
            Ok(()) => TargetOutcome::Succeeded,
            Err(e) => match e.kind {
                RemoteErrorKind::NotFound => TargetOutcome::AlreadyAbsent,
                RemoteErrorKind::PermissionDenied => TargetOutcome::Denied(e),
                _ => TargetOutcome::Failed(e),
            },
        }
    }

    /// Classify a create/update/save result.
    pub fn from_write<T>(result: &std::result::Result<T, RemoteError>) -> Self {
        match result {
            Ok(_) => TargetOutcome::Succeeded,
            Err(e) if e.kind == RemoteErrorKind::PermissionDenied => {
                TargetOutcome::Denied(e.clone())
            }
            Err(e) => TargetOutcome::Failed(e.clone()),
        }
    }
}

/// Per-batch tally of target outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Targets the server accepted or already lacked
    pub succeeded: Vec<RecordId>,
    /// Targets that failed and must be restored
    pub failed: Vec<RecordId>,
    /// Targets the server refused for lack of permission
    pub denied: Vec<RecordId>,
    rollback: Vec<RecordId>,
}

impl BatchOutcome {
    /// Tally outcomes under the given denial policy.
    pub fn classify(
        outcomes: impl IntoIterator<Item = (RecordId, TargetOutcome)>,
        policy: DeniedPolicy,
    ) -> Self {
        let mut batch = BatchOutcome::default();
        for (id, outcome) in outcomes {
            match outcome {
                TargetOutcome::Succeeded | TargetOutcome::AlreadyAbsent => {
                    batch.succeeded.push(id)
                }
                TargetOutcome::Denied(_) => {
                    batch.denied.push(id);
                    if policy == DeniedPolicy::Rollback {
                        batch.rollback.push(id);
                    }
                }
                TargetOutcome::Failed(_) => {
                    batch.failed.push(id);
                    batch.rollback.push(id);
                }
            }
        }
        batch
    }

    /// Ids whose optimistic change must be undone.
    pub fn rollback_ids(&self) -> &[RecordId] {
        &self.rollback
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.denied.len()
    }

    /// The event that settles the remote phase.
    pub fn event(&self) -> MutationEvent {
        if self.rollback.is_empty() {
            MutationEvent::AllSucceeded
        } else if self.rollback.len() == self.total() {
            MutationEvent::AllFailed
        } else {
            MutationEvent::SomeFailed
        }
    }
}
