//! Append-only record of supervisor decisions
//!
//! Every entry carries a sequence number assigned under the journal lock, so
//! ordering between entries is total even when readers clone the journal
//! from other tasks.

use crate::types::{SlotId, VersionToken, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    /// Worker launched
    Spawned {
        /// Version assigned at spawn
        version: VersionToken,
        /// Worker this one replaces, if any
        predecessor: Option<WorkerId>,
    },
    /// Worker reported it accepts traffic
    Listening,
    /// Worker asked to be retired
    RetirementRequested,
    /// Shutdown command sent
    ShutdownSent,
    /// Grace period or ready timeout elapsed; kill issued
    ForceKilled,
    /// Process ended
    Exited {
        /// Exit code when known
        code: Option<i32>,
        /// Whether a shutdown preceded the exit
        planned: bool,
    },
    /// One replacement attempt failed
    ReplacementFailed {
        /// Attempt number (1-based)
        attempt: u32,
        /// Failure description
        reason: String,
    },
    /// Replacement given up; the worker keeps serving
    ReplacementAbandoned {
        /// Attempts made
        attempts: u32,
    },
    /// Unplanned exit will be followed by a fresh worker
    Respawned {
        /// Restarts in the current window
        attempt: usize,
    },
    /// Worker reported a workload fault
    RunnerFailed {
        /// Reported error text
        error: String,
    },
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal, starting at 0
    pub seq: u64,
    /// Wall clock, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Worker concerned
    pub worker_id: WorkerId,
    /// Slot the worker serves
    pub slot: SlotId,
    /// The decision or observation
    pub event: JournalEvent,
}

/// Shared journal; clones append to the same record
#[derive(Debug, Clone, Default)]
pub struct Journal {
    inner: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    /// Create an empty journal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number
    pub fn record(&self, worker_id: WorkerId, slot: SlotId, event: JournalEvent) -> u64 {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let mut guard = self.inner.lock();
        let seq = guard.len() as u64;
        guard.push(JournalEntry {
            seq,
            timestamp_ms,
            worker_id,
            slot,
            event,
        });
        seq
    }

    /// Copy of all entries in order
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().clone()
    }

    /// Entries concerning one worker
    #[must_use]
    pub fn for_worker(&self, worker_id: WorkerId) -> Vec<JournalEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.worker_id == worker_id)
            .cloned()
            .collect()
    }

    /// Sequence number of the first entry matching `predicate`
    pub fn position(&self, predicate: impl Fn(&JournalEntry) -> bool) -> Option<u64> {
        self.inner
            .lock()
            .iter()
            .find(|e| predicate(e))
            .map(|e| e.seq)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check for an empty journal
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
