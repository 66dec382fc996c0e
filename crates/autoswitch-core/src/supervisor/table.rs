//! Supervisor-owned worker records

use crate::protocol::SupervisorCommand;
use crate::state_machine::{validate_transition, WorkerState};
use crate::types::{SlotId, VersionToken, WorkerId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// One managed worker; never shared outside the control loop
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) slot: SlotId,
    pub(crate) version: VersionToken,
    pub(crate) pid: Option<u32>,
    pub(crate) state: WorkerState,
    pub(crate) listening: bool,
    /// Set once the worker completes its bridge handshake
    pub(crate) commands: Option<mpsc::UnboundedSender<SupervisorCommand>>,
    pub(crate) kill: mpsc::Sender<()>,
    /// Worker this one is replacing, until this one is listening
    pub(crate) predecessor: Option<WorkerId>,
    /// Replacement in flight for this worker
    pub(crate) successor: Option<WorkerId>,
    pub(crate) shutdown_sent: bool,
    pub(crate) replacement_attempts: u32,
    /// Drift reported while the slot was still being handed over
    pub(crate) pending_retirement: bool,
    /// Ready timeout armed and listening not yet reported
    pub(crate) awaiting_ready: bool,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        slot: SlotId,
        version: VersionToken,
        pid: Option<u32>,
        kill: mpsc::Sender<()>,
        predecessor: Option<WorkerId>,
    ) -> Self {
        Self {
            id,
            slot,
            version,
            pid,
            state: WorkerState::Spawning,
            listening: false,
            commands: None,
            kill,
            predecessor,
            successor: None,
            shutdown_sent: false,
            replacement_attempts: 0,
            pending_retirement: false,
            awaiting_ready: predecessor.is_some(),
        }
    }

    /// Move to `to`; illegal moves are logged and ignored
    pub(crate) fn transition(&mut self, to: WorkerState) -> bool {
        match validate_transition(self.state, to) {
            Ok(()) => {
                self.state = to;
                true
            }
            Err(err) => {
                warn!(worker_id = %self.id, %err, "ignoring transition");
                false
            }
        }
    }

    /// Ask the watcher task to kill the process
    pub(crate) fn request_kill(&self) {
        let _ = self.kill.try_send(());
    }

    pub(crate) fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.id,
            slot: self.slot,
            version: self.version.clone(),
            pid: self.pid,
            state: self.state,
            listening: self.listening,
            predecessor: self.predecessor,
            successor: self.successor,
        }
    }
}

/// Read-only view of one worker record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Worker id
    pub worker_id: WorkerId,
    /// Slot served
    pub slot: SlotId,
    /// Version assigned at spawn
    pub version: VersionToken,
    /// OS process id, when known
    pub pid: Option<u32>,
    /// Lifecycle state
    pub state: WorkerState,
    /// Whether the worker reported listening
    pub listening: bool,
    /// Worker being replaced by this one
    pub predecessor: Option<WorkerId>,
    /// Replacement in flight for this one
    pub successor: Option<WorkerId>,
}
