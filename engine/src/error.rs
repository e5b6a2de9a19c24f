//! Error types for the grantsync engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the grantsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Identity errors
    #[error("persisted id {0} falls inside the virtual range")]
    PersistedIdOutOfRange(RecordId),

    #[error("position {position} exceeds the id span of search source '{search_source}'")]
    SourceSpanExhausted {
        search_source: String,
        position: u64,
    },

    #[error("provisional id space exhausted")]
    ProvisionalSpaceExhausted,

    // Wire errors
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid stored record {id}: {reason}")]
    InvalidStoredRecord { id: RecordId, reason: String },

    // State errors
    #[error("invalid tombstone encoding: {0}")]
    InvalidTombstones(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("illegal mutation transition: {event} while {from}")]
    IllegalTransition { from: String, event: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
