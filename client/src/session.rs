//! Per-collection sessions and the registry that hands them out.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use grantsync_engine::{
    is_virtual, Clock, Collection, Fields, IdentityResolver, MergeReport, Record, RecordId,
    Residency, SearchDeduplicator, SearchSource, SyncTracker,
};
use crate::cache::{CacheStore, RenderReceiver};
use crate::config::Config;
use crate::coordinator::{MutationCoordinator, MutationReport, SharedResolver};
use crate::error::Result;
use crate::notice::NoticeSink;
use crate::scheduler::{ReconciliationScheduler, ScopeToken, ViewScope};
use crate::search::SearchGenerator;
use crate::service::RecordStoreService;
use crate::tombstones::{TombstoneRegistry, TombstoneStorage};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub service: Arc<dyn RecordStoreService>,
    pub generator: Arc<dyn SearchGenerator>,
    pub storage: Arc<dyn TombstoneStorage>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub notices: NoticeSink,
}

/// Everything a view needs to show and mutate one collection.
pub struct CollectionSession {
    collection: Collection,
    cache: Arc<CacheStore>,
    tombstones: Arc<TombstoneRegistry>,
    scheduler: Arc<ReconciliationScheduler>,
    coordinator: MutationCoordinator,
    generator: Arc<dyn SearchGenerator>,
    resolver: SharedResolver,
    sync: Mutex<SyncTracker>,
}

impl CollectionSession {
    /// Open a session, loading the collection's tombstones from storage.
    pub fn open(
        collection: Collection,
        deps: &SessionDeps,
        resolver: SharedResolver,
        scope: ScopeToken,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(collection));
        let tombstones = Arc::new(TombstoneRegistry::open(
            collection,
            Arc::clone(&deps.storage),
        ));
        let scheduler = Arc::new(ReconciliationScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&tombstones),
            Arc::clone(&deps.service),
            &deps.config,
            deps.notices.clone(),
            scope,
        ));
        let coordinator = MutationCoordinator::new(
            Arc::clone(&scheduler),
            Arc::clone(&resolver),
            Arc::clone(&deps.clock),
            deps.notices.clone(),
            deps.config.denied_policy,
        );
        let sync = SyncTracker::new(Arc::clone(&deps.clock), deps.config.sync_interval);

        tracing::info!(%collection, "Session opened");

        Self {
            collection,
            cache,
            tombstones,
            scheduler,
            coordinator,
            generator: Arc::clone(&deps.generator),
            resolver,
            sync: Mutex::new(sync),
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn tombstones(&self) -> &TombstoneRegistry {
        &self.tombstones
    }

    /// Records the view should show: the cache minus tombstoned ids.
    pub fn rendered(&self) -> Vec<Record> {
        self.cache.rendered(&self.tombstones.snapshot())
    }

    pub fn subscribe(&self) -> RenderReceiver {
        self.cache.subscribe()
    }

    pub async fn create(&self, fields: Fields) -> Result<MutationReport> {
        self.coordinator.create(fields).await
    }

    pub async fn update(&self, id: RecordId, fields: Fields) -> Result<MutationReport> {
        self.coordinator.update(id, fields).await
    }

    pub async fn delete(&self, ids: &[RecordId]) -> Result<MutationReport> {
        self.coordinator.delete(ids).await
    }

    /// Save a record (typically a search result) into this collection.
    pub async fn save(&self, record: &Record) -> Result<MutationReport> {
        self.coordinator.save(record).await
    }

    /// Remove saved records. Virtual ids address the snapshot side table.
    pub async fn unsave(&self, ids: &[RecordId]) -> Result<MutationReport> {
        self.coordinator.delete(ids).await
    }

    /// Fetch and merge the full collection now.
    pub async fn refresh(&self) -> Result<MergeReport> {
        let report = self.scheduler.refresh().await?;
        self.lock_sync().mark_synced();
        Ok(report)
    }

    /// Refresh only if the periodic sync interval has elapsed.
    pub async fn refresh_if_due(&self) -> Result<Option<MergeReport>> {
        let due = self.lock_sync().is_due();
        if !due {
            tracing::trace!(collection = %self.collection, "Periodic sync not due");
            return Ok(None);
        }
        self.refresh().await.map(Some)
    }

    /// Run a search and show its results in this collection.
    ///
    /// Results replace the previous ephemeral results of the same source.
    /// A failing generator yields an empty batch.
    pub async fn search(&self, source: SearchSource, query: &str) -> Vec<Record> {
        let raw = match self.generator.generate(source, query).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(collection = %self.collection, %source, error = %e, "Search failed");
                Vec::new()
            }
        };
        let tombstones = self.tombstones.snapshot();

        let batch = self.cache.modify(|snapshot| {
            let previous: Vec<RecordId> = snapshot
                .records()
                .filter(|r| r.residency == Residency::Ephemeral && source.owns(r.id))
                .map(|r| r.id)
                .collect();
            for id in previous {
                snapshot.remove(id);
            }

            // Tombstoned virtual ids stay reserved so a new result never hides behind one.
            let reserved: BTreeSet<RecordId> =
                tombstones.iter().filter(|id| is_virtual(*id)).collect();

            let resolver = self.lock_resolver();
            let batch =
                SearchDeduplicator::new(&resolver).normalize_reserving(raw, snapshot, &reserved);
            for record in &batch.records {
                snapshot.insert(record.clone());
            }
            batch
        });

        tracing::debug!(
            collection = %self.collection,
            %source,
            results = batch.records.len(),
            duplicates = batch.duplicates,
            relocated = batch.relocated,
            out_of_range = batch.out_of_range,
            "Search results normalized"
        );

        batch.records
    }

    fn lock_sync(&self) -> MutexGuard<'_, SyncTracker> {
        self.sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_resolver(&self) -> MutexGuard<'_, IdentityResolver> {
        self.resolver.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CollectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionSession")
            .field("collection", &self.collection)
            .field("cached", &self.cache.read().len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

/// Hands out one shared session per collection.
///
/// The registry owns the view scope: dropping it cancels every pending
/// reconciliation run of every session it opened.
pub struct SessionRegistry {
    deps: SessionDeps,
    resolver: SharedResolver,
    sessions: DashMap<Collection, Arc<CollectionSession>>,
    scope: ViewScope,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            resolver: Arc::new(Mutex::new(IdentityResolver::new())),
            sessions: DashMap::new(),
            scope: ViewScope::new(),
        }
    }

    /// The session for `collection`, opening it on first use.
    pub fn session(&self, collection: Collection) -> Arc<CollectionSession> {
        self.sessions
            .entry(collection)
            .or_insert_with(|| {
                Arc::new(CollectionSession::open(
                    collection,
                    &self.deps,
                    Arc::clone(&self.resolver),
                    self.scope.token(),
                ))
            })
            .value()
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Refresh every open session whose periodic sync is due.
    pub async fn refresh_due(&self) -> Vec<(Collection, Result<Option<MergeReport>>)> {
        let sessions: Vec<Arc<CollectionSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            let result = session.refresh_if_due().await;
            results.push((session.collection(), result));
        }
        results
    }

    /// Cancel all pending reconciliation runs.
    pub fn close(&self) {
        tracing::info!(sessions = self.sessions.len(), "Closing sessions");
        self.scope.cancel();
    }
}
