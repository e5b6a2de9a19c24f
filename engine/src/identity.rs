//! Identifier partitioning.
//!
//! Record ids share one integer space split at [`VIRTUAL_ID_THRESHOLD`]:
//!
//! ```text
//! 0 ........ 9_999 | 10_000 .. 19_999 | 20_000 .. 29_999 | ... | 1_000_000 ..
//!   persisted      |  grant search    |  suggestions     |     | provisional
//! ```
//!
//! Persisted ids are whatever the backing store assigns. Everything at or
//! above the threshold is handed out here, from spans that never overlap.

use crate::{error::Result, Error, RecordId};
use serde::{Deserialize, Serialize};

/// First id of the virtual namespace (K).
pub const VIRTUAL_ID_THRESHOLD: RecordId = 10_000;

/// Number of ids reserved for each search source.
pub const SOURCE_SPAN: RecordId = 10_000;

/// First id handed out for optimistic creates awaiting a server id.
pub const PROVISIONAL_OFFSET: RecordId = 1_000_000;

const _: () = assert!(SearchSource::GrantSearch.offset() >= VIRTUAL_ID_THRESHOLD);
const _: () = assert!(SearchSource::Suggestions.offset() + SOURCE_SPAN <= PROVISIONAL_OFFSET);

/// Returns true when `id` belongs to the virtual namespace.
pub fn is_virtual(id: RecordId) -> bool {
    id >= VIRTUAL_ID_THRESHOLD
}

/// Which half of the id space a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Backed by a durable row, addressable by id alone.
    Persisted,
    /// Client-assigned; carries its own snapshot.
    Virtual,
}

impl Namespace {
    /// Namespace an id belongs to.
    pub fn of(id: RecordId) -> Self {
        if is_virtual(id) {
            Namespace::Virtual
        } else {
            Namespace::Persisted
        }
    }
}

/// An external source of ephemeral records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    /// Keyword grant search.
    GrantSearch,
    /// Generated grant suggestions.
    Suggestions,
}

impl SearchSource {
    pub const ALL: [SearchSource; 2] = [SearchSource::GrantSearch, SearchSource::Suggestions];

    /// First id of this source's span.
    pub const fn offset(self) -> RecordId {
        match self {
            SearchSource::GrantSearch => 10_000,
            SearchSource::Suggestions => 20_000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SearchSource::GrantSearch => "grant_search",
            SearchSource::Suggestions => "suggestions",
        }
    }

    /// Whether `id` falls in this source's span.
    pub fn owns(self, id: RecordId) -> bool {
        id >= self.offset() && id < self.offset() + SOURCE_SPAN
    }

    /// The source whose span contains `id`, if any.
    pub fn of(id: RecordId) -> Option<SearchSource> {
        Self::ALL.into_iter().find(|source| source.owns(id))
    }
}

impl std::fmt::Display for SearchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an id request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdOrigin {
    /// The backing store already assigned this id.
    Persisted(RecordId),
    /// An ephemeral search result at `position` in its batch.
    SearchResult {
        source: SearchSource,
        position: u64,
    },
}

/// Hands out identifiers without ever crossing namespaces.
///
/// Search ids are a pure function of `(source, position)` so the same batch
/// always maps to the same ids. Provisional ids are drawn from a monotonic
/// counter and are never reissued within the resolver's lifetime.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    next_provisional: RecordId,
}

impl IdentityResolver {
    /// Create a resolver for a fresh session.
    pub fn new() -> Self {
        Self {
            next_provisional: PROVISIONAL_OFFSET,
        }
    }

    /// Resolve the id for a record of the given origin.
    pub fn assign_id(&self, origin: IdOrigin) -> Result<RecordId> {
        match origin {
            IdOrigin::Persisted(id) if is_virtual(id) => Err(Error::PersistedIdOutOfRange(id)),
            IdOrigin::Persisted(id) => Ok(id),
            IdOrigin::SearchResult { source, position } => {
                if position >= SOURCE_SPAN {
                    return Err(Error::SourceSpanExhausted {
                        search_source: source.name().to_string(),
                        position,
                    });
                }
                Ok(source.offset() + position)
            }
        }
    }

    /// Allocate a fresh provisional id for an optimistic create.
    pub fn next_provisional(&mut self) -> Result<RecordId> {
        let id = self.next_provisional;
        self.next_provisional = id
            .checked_add(1)
            .ok_or(Error::ProvisionalSpaceExhausted)?;
        Ok(id)
    }

    /// Whether `id` was drawn from the provisional span.
    pub fn is_provisional(id: RecordId) -> bool {
        id >= PROVISIONAL_OFFSET
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}
