//! The server-owned collections kept in the local cache.

use serde::{Deserialize, Serialize};

/// A cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Proposals,
    Reports,
    SavedGrants,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Proposals,
        Collection::Reports,
        Collection::SavedGrants,
    ];

    /// Stable collection name used on the wire and in storage keys.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Proposals => "proposals",
            Collection::Reports => "reports",
            Collection::SavedGrants => "saved_grants",
        }
    }

    /// Well-known key the collection's tombstones persist under.
    pub fn tombstone_key(self) -> String {
        format!("tombstones:{}", self.name())
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
