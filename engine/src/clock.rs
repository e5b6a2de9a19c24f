//! Wall clocks and the periodic full-sync tracker.
//!
//! Time is injected through [`Clock`] so that everything deciding "is a sync
//! due?" can be driven deterministically in tests.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: Timestamp) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Remembers when a collection was last fully synced.
///
/// One tracker is constructed per collection and handed to whoever decides
/// whether a periodic sync is due.
pub struct SyncTracker {
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_sync: Option<Timestamp>,
}

impl SyncTracker {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            clock,
            interval,
            last_sync: None,
        }
    }

    /// True when no sync has happened yet or the interval has elapsed.
    pub fn is_due(&self) -> bool {
        match self.last_sync {
            None => true,
            Some(last) => {
                self.clock.now_ms().saturating_sub(last) >= self.interval.as_millis() as u64
            }
        }
    }

    /// Record a completed sync at the current time.
    pub fn mark_synced(&mut self) {
        self.last_sync = Some(self.clock.now_ms());
    }

    pub fn last_sync(&self) -> Option<Timestamp> {
        self.last_sync
    }

    pub fn now_ms(&self) -> Timestamp {
        self.clock.now_ms()
    }
}

impl std::fmt::Debug for SyncTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTracker")
            .field("interval", &self.interval)
            .field("last_sync", &self.last_sync)
            .finish()
    }
}
