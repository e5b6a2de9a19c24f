//! Delayed re-fetch and merge after mutations.
//!
//! The backing store is eventually consistent: a list issued right after a
//! write may not reflect it yet. After every mutation the scheduler re-fetches
//! the collection on a bounded delay plan and merges each successful fetch
//! into the cache. Runs belong to a [`ViewScope`]; once the scope is cancelled
//! or dropped, no run performs another fetch or write.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use grantsync_engine::{
    stale_targets, AbsenceTracker, Collection, MergeReport, MutationIntent, ReconcilePlan, Reconciler,
    Record, RecordId, RemoteError, TombstonePruning,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::notice::{Notice, NoticeSink};
use crate::service::RecordStoreService;
use crate::tombstones::TombstoneRegistry;

/// Lifetime of the view that owns scheduled work.
///
/// Dropping the scope cancels it.
#[derive(Debug)]
pub struct ViewScope {
    sender: watch::Sender<bool>,
}

impl ViewScope {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// A handle that observes this scope's cancellation.
    pub fn token(&self) -> ScopeToken {
        ScopeToken {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            tracing::debug!("View scope cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for ViewScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ViewScope {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Observer half of a [`ViewScope`].
#[derive(Debug, Clone)]
pub struct ScopeToken {
    receiver: watch::Receiver<bool>,
}

impl ScopeToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once the scope is cancelled or gone.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// How a scheduled run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every attempt ran.
    Completed {
        /// Attempts whose fetch succeeded and was merged
        merged: usize,
        /// Attempts whose fetch failed
        failed: usize,
        /// Deleted ids still returned by the last successful fetch, or
        /// every deleted id when no fetch succeeded
        stale: Vec<RecordId>,
    },
    /// The view went away after `attempts` attempts.
    Cancelled { attempts: usize },
}

/// Re-fetches and merges one collection.
pub struct ReconciliationScheduler {
    collection: Collection,
    cache: Arc<CacheStore>,
    tombstones: Arc<TombstoneRegistry>,
    service: Arc<dyn RecordStoreService>,
    tracker: Mutex<AbsenceTracker>,
    create_plan: ReconcilePlan,
    delete_plan: ReconcilePlan,
    pruning: TombstonePruning,
    notices: NoticeSink,
    scope: ScopeToken,
}

impl ReconciliationScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        tombstones: Arc<TombstoneRegistry>,
        service: Arc<dyn RecordStoreService>,
        config: &Config,
        notices: NoticeSink,
        scope: ScopeToken,
    ) -> Self {
        Self {
            collection: cache.collection(),
            cache,
            tombstones,
            service,
            tracker: Mutex::new(AbsenceTracker::new()),
            create_plan: config.create_plan.clone(),
            delete_plan: config.delete_plan.clone(),
            pruning: config.pruning,
            notices,
            scope,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub(crate) fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub(crate) fn tombstones(&self) -> &Arc<TombstoneRegistry> {
        &self.tombstones
    }

    pub(crate) fn service(&self) -> &Arc<dyn RecordStoreService> {
        &self.service
    }

    /// Start a reconciliation run for a mutation.
    ///
    /// Deletes use the delete plan and check their targets for staleness at
    /// the end; everything else uses the create plan.
    pub fn schedule(self: &Arc<Self>, intent: &MutationIntent) -> JoinHandle<RunOutcome> {
        let (plan, targets) = if intent.is_delete() {
            (self.delete_plan.clone(), intent.target_ids.clone())
        } else {
            (self.create_plan.clone(), Vec::new())
        };

        tracing::debug!(
            collection = %self.collection,
            mutation_id = %intent.id,
            attempts = plan.attempts(),
            "Scheduling reconciliation"
        );

        let this = Arc::clone(self);
        let scope = self.scope.clone();
        tokio::spawn(async move { this.run(plan, targets, scope).await })
    }

    async fn run(
        &self,
        plan: ReconcilePlan,
        targets: Vec<RecordId>,
        mut scope: ScopeToken,
    ) -> RunOutcome {
        let mut merged = 0;
        let mut failed = 0;
        let mut last_remote: Option<BTreeSet<RecordId>> = None;

        for (attempt, delay) in plan.delays().enumerate() {
            tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    tracing::debug!(collection = %self.collection, attempt, "Reconciliation cancelled");
                    return RunOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let fetched = self.fetch().await;
            if scope.is_cancelled() {
                tracing::debug!(collection = %self.collection, attempt, "Discarding fetch for closed view");
                return RunOutcome::Cancelled {
                    attempts: attempt + 1,
                };
            }

            match fetched {
                Ok(records) => {
                    let report = self.apply(records);
                    merged += 1;
                    last_remote = Some(report.remote_ids);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        collection = %self.collection,
                        attempt,
                        error = %e,
                        "Reconciliation fetch failed"
                    );
                }
            }
        }

        // With no successful fetch nothing confirms the deletes went through.
        let unconfirmed = match &last_remote {
            Some(remote) => stale_targets(&targets, remote),
            None => targets,
        };
        let stale: Vec<RecordId> = unconfirmed
            .into_iter()
            .filter(|id| self.tombstones.contains(*id))
            .collect();

        if !stale.is_empty() {
            self.notices.emit(Notice::Stale {
                collection: self.collection,
                ids: stale.clone(),
            });
        }

        RunOutcome::Completed {
            merged,
            failed,
            stale,
        }
    }

    /// Fetch the full collection from the service.
    ///
    /// Rows that cannot become records are skipped.
    pub async fn fetch(&self) -> Result<Vec<Record>, RemoteError> {
        let rows = self.service.list(self.collection).await.into_data()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(collection = %self.collection, error = %e, "Skipping invalid row");
                    None
                }
            })
            .collect())
    }

    /// Merge one fetch into the cache and prune confirmed tombstones.
    pub fn apply(&self, fetched: Vec<Record>) -> MergeReport {
        let tombstones = self.tombstones.snapshot();

        let report = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            self.cache.modify_if(|snapshot| {
                let report = Reconciler::new(&tombstones, &mut *tracker, self.pruning)
                    .merge(snapshot, fetched);
                let changed = report.changed();
                (report, changed)
            })
        };

        if !report.prunable.is_empty() {
            let pruned = self.tombstones.remove(&report.prunable);
            tracing::info!(collection = %self.collection, pruned, "Pruned confirmed tombstones");
        }

        tracing::debug!(
            collection = %self.collection,
            added = report.added.len(),
            refreshed = report.refreshed.len(),
            removed = report.removed.len(),
            suppressed = report.suppressed.len(),
            "Merged fetch"
        );

        report
    }

    /// Fetch and merge once.
    pub async fn refresh(&self) -> Result<MergeReport, RemoteError> {
        let fetched = self.fetch().await?;
        Ok(self.apply(fetched))
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("collection", &self.collection)
            .field("create_plan", &self.create_plan)
            .field("delete_plan", &self.delete_plan)
            .field("pruning", &self.pruning)
            .finish()
    }
}
