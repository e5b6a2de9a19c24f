//! # grantsync client
//!
//! Async runtime around `grantsync-engine`: the encapsulated cache store, the
//! durable tombstone registry, the mutation coordinator and the
//! reconciliation scheduler, wired together per collection.
//!
//! A view obtains a [`CollectionSession`] from a [`SessionRegistry`], renders
//! [`CollectionSession::rendered`], listens on
//! [`CollectionSession::subscribe`] for re-renders and drains the
//! [`NoticeReceiver`] for user-facing notices. Dropping the registry cancels
//! every pending reconciliation run.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod notice;
pub mod scheduler;
pub mod search;
pub mod service;
pub mod session;
pub mod tombstones;

pub use cache::{CacheStore, RenderReceiver};
pub use config::{Config, ConfigError};
pub use coordinator::{MutationCoordinator, MutationReport, SharedResolver};
pub use error::{ClientError, Result};
pub use notice::{Notice, NoticeReceiver, NoticeSink, StampedNotice};
pub use scheduler::{ReconciliationScheduler, RunOutcome, ScopeToken, ViewScope};
pub use search::{CannedSearch, SearchGenerator};
pub use service::{DeleteTarget, InMemoryRecordStore, RecordStoreService, SaveRequest};
pub use session::{CollectionSession, SessionDeps, SessionRegistry};
pub use tombstones::{FileStorage, MemoryStorage, TombstoneRegistry, TombstoneStorage};
