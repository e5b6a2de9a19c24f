//! Shared harness for the client integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use grantsync_client::{
    CannedSearch, Config, InMemoryRecordStore, MemoryStorage, MutationReport, Notice,
    NoticeReceiver, NoticeSink, SessionDeps, SessionRegistry, TombstoneStorage,
};
use grantsync_engine::{Collection, Fields, ManualClock, RecordId};
use serde_json::json;

pub fn fields(title: &str) -> Fields {
    json!({ "title": title }).as_object().cloned().unwrap()
}

/// One simulated backend plus a registry over it.
pub struct Harness {
    pub store: Arc<InMemoryRecordStore>,
    pub search: Arc<CannedSearch>,
    pub clock: Arc<ManualClock>,
    pub deps: SessionDeps,
    pub registry: SessionRegistry,
    pub notices: NoticeReceiver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Config::default(), MemoryStorage::new_shared())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with(config, MemoryStorage::new_shared())
    }

    pub fn with(config: Config, storage: Arc<dyn TombstoneStorage>) -> Self {
        let store = InMemoryRecordStore::new_shared();
        let search = CannedSearch::new_shared();
        let clock = Arc::new(ManualClock::new(1_000));
        let (notices, receiver) = NoticeSink::channel();
        let deps = SessionDeps {
            service: store.clone(),
            generator: search.clone(),
            storage,
            clock: clock.clone(),
            config: Arc::new(config),
            notices,
        };

        Self {
            store,
            search,
            clock,
            registry: SessionRegistry::new(deps.clone()),
            deps,
            notices: receiver,
        }
    }

    /// Seed persisted rows titled after their ids.
    pub fn seed(&self, collection: Collection, ids: &[RecordId]) {
        for id in ids {
            self.store
                .seed_fields(collection, *id, fields(&format!("record {id}")));
        }
    }

    /// A fresh registry over the same backend and tombstone storage, as
    /// after an app restart.
    pub fn reopen(&self) -> SessionRegistry {
        SessionRegistry::new(self.deps.clone())
    }

    /// Every notice raised so far.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(stamped) = self.notices.try_recv() {
            out.push(stamped.notice);
        }
        out
    }
}

/// Stop a report's reconciliation run before it fetches anything.
pub fn detach(report: &mut MutationReport) {
    if let Some(handle) = report.reconciliation.take() {
        handle.abort();
    }
}

pub fn rendered_ids(session: &grantsync_client::CollectionSession) -> Vec<RecordId> {
    session.rendered().iter().map(|r| r.id).collect()
}
