//! User-facing notifications.
//!
//! Mutations and reconciliation runs report their outcome as a [`Notice`].
//! Notices are stamped and pushed down an unbounded channel; a view drains it
//! and shows them however it likes.

use chrono::{DateTime, Utc};
use grantsync_engine::{Collection, MutationKind, RecordId};
use serde::Serialize;
use tokio::sync::mpsc;

/// A user-facing outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Every target succeeded.
    Success {
        collection: Collection,
        kind: MutationKind,
        count: usize,
    },
    /// Some targets failed and were restored.
    PartialSuccess {
        collection: Collection,
        kind: MutationKind,
        succeeded: usize,
        failed: usize,
    },
    /// Nothing succeeded; the cache was restored.
    Failure {
        collection: Collection,
        kind: MutationKind,
        failed: usize,
        reason: String,
    },
    /// The server refused some targets for lack of permission.
    PermissionDenied {
        collection: Collection,
        ids: Vec<RecordId>,
    },
    /// Deleted ids the server still returned after every reconciliation attempt.
    Stale {
        collection: Collection,
        ids: Vec<RecordId>,
    },
}

impl Notice {
    pub fn collection(&self) -> Collection {
        match self {
            Notice::Success { collection, .. }
            | Notice::PartialSuccess { collection, .. }
            | Notice::Failure { collection, .. }
            | Notice::PermissionDenied { collection, .. }
            | Notice::Stale { collection, .. } => *collection,
        }
    }

    /// The text shown to the user.
    pub fn message(&self) -> String {
        match self {
            Notice::Success { kind, count, .. } => match *count {
                1 => format!("{} succeeded", noun(*kind)),
                n => format!("{n} {} succeeded", plural(*kind)),
            },
            Notice::PartialSuccess {
                succeeded, failed, ..
            } => format!("{succeeded} succeeded, {failed} failed"),
            Notice::Failure { kind, reason, .. } => format!("{} failed: {reason}", noun(*kind)),
            Notice::PermissionDenied { ids, .. } => {
                format!("Permission denied for {} item(s)", ids.len())
            }
            Notice::Stale { ids, .. } => format!(
                "{} deleted item(s) still reported by the server; the list may be out of date",
                ids.len()
            ),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Notice::Success { .. })
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.collection(), self.message())
    }
}

fn noun(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "Create",
        MutationKind::Update => "Update",
        MutationKind::Delete => "Delete",
    }
}

fn plural(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Create => "creates",
        MutationKind::Update => "updates",
        MutationKind::Delete => "deletes",
    }
}

/// A notice with the time it was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StampedNotice {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub notice: Notice,
}

/// Receiver half handed to the view.
pub type NoticeReceiver = mpsc::UnboundedReceiver<StampedNotice>;

/// Cloneable sending half shared by coordinators and schedulers.
#[derive(Debug, Clone)]
pub struct NoticeSink {
    sender: mpsc::UnboundedSender<StampedNotice>,
}

impl NoticeSink {
    pub fn channel() -> (Self, NoticeReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Log and deliver a notice. A closed view is not an error.
    pub fn emit(&self, notice: Notice) {
        if notice.is_error() {
            tracing::warn!(collection = %notice.collection(), "{}", notice.message());
        } else {
            tracing::info!(collection = %notice.collection(), "{}", notice.message());
        }

        let stamped = StampedNotice {
            at: Utc::now(),
            notice,
        };
        if self.sender.send(stamped).is_err() {
            tracing::debug!("Notice dropped; no view is listening");
        }
    }
}
