//! Search and suggestion generators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use grantsync_engine::{RawSearchItem, RemoteError, SearchSource};

/// Produces ephemeral grant results for a query.
#[async_trait]
pub trait SearchGenerator: Send + Sync {
    async fn generate(
        &self,
        source: SearchSource,
        query: &str,
    ) -> Result<Vec<RawSearchItem>, RemoteError>;
}

/// Returns pre-registered batches keyed by source and query.
#[derive(Debug, Default)]
pub struct CannedSearch {
    batches: DashMap<(SearchSource, String), Vec<RawSearchItem>>,
    failing: AtomicBool,
}

impl CannedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register the batch returned for `query` on `source`.
    pub fn insert(&self, source: SearchSource, query: &str, items: Vec<RawSearchItem>) {
        self.batches.insert((source, query.to_string()), items);
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchGenerator for CannedSearch {
    async fn generate(
        &self,
        source: SearchSource,
        query: &str,
    ) -> Result<Vec<RawSearchItem>, RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::network(format!("{source} generator unavailable")));
        }
        Ok(self
            .batches
            .get(&(source, query.to_string()))
            .map(|items| items.value().clone())
            .unwrap_or_default())
    }
}
