//! Supervisor
//!
//! A single control loop owns the worker table. Bridge events, process exits,
//! timers and version fetches all arrive as messages; nothing else mutates
//! the table, so no locks are involved.
//!
//! # Switch protocol
//!
//! 1. Worker A sends `disconnect` and moves to `Retiring`
//! 2. The supervisor fetches the current version and launches successor B
//! 3. B reports `listening`; only then is `shutdown` sent to A
//! 4. A is force-killed if it outlives the grace period
//!
//! A replacement that cannot be brought up is retried with backoff. When the
//! attempts run out A returns to `Listening` and keeps serving.

mod journal;
mod launcher;
mod restart;
mod table;

pub use journal::{Journal, JournalEntry, JournalEvent};
pub use launcher::{ExitOutcome, LaunchRequest, Launcher, ProcessLauncher, WorkerProcess};
pub use restart::{RestartDecision, RestartTracker};
pub use table::WorkerSummary;

use crate::bridge::{BridgeEvent, ControlBridge};
use crate::config::SwitchConfig;
use crate::error::{LaunchError, OracleError, SupervisorError};
use crate::oracle::VersionOracle;
use crate::protocol::{SupervisorCommand, WorkerMessage};
use crate::state_machine::WorkerState;
use crate::types::{SlotId, VersionToken, WorkerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use table::WorkerHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Builds and starts a supervisor
pub struct Supervisor {
    config: SwitchConfig,
    oracle: Arc<dyn VersionOracle>,
    launcher: Arc<dyn Launcher>,
    journal: Journal,
}

impl Supervisor {
    /// Create a supervisor
    #[must_use]
    pub fn new(
        config: SwitchConfig,
        oracle: Arc<dyn VersionOracle>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            config,
            oracle,
            launcher,
            journal: Journal::new(),
        }
    }

    /// Record decisions into an existing journal
    #[inline]
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Journal this supervisor records into
    #[inline]
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Bind the bridge, launch the initial workers and start the loop
    ///
    /// # Errors
    /// Fails when the bridge cannot bind, the initial version fetch fails,
    /// or an initial worker cannot be launched.
    pub async fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        let (bridge, bridge_events) = ControlBridge::bind()
            .await
            .map_err(SupervisorError::Bridge)?;

        let version = self
            .oracle
            .fetch_version()
            .await
            .map_err(SupervisorError::InitialVersion)?;
        info!(%version, slots = self.config.slots, "supervisor starting");

        let journal = self.journal.clone();
        let mut control_loop = ControlLoop::new(self, bridge);

        for slot in 0..control_loop.config.slots.max(1) {
            if let Err(err) = control_loop
                .spawn_worker(SlotId(slot), version.clone(), None)
                .await
            {
                error!(%err, "initial worker launch failed");
                control_loop.terminate_all().await;
                return Err(SupervisorError::InitialLaunch(err));
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(control_loop.run(bridge_events, control_rx));

        Ok(SupervisorHandle {
            control: control_tx,
            task,
            journal,
        })
    }

    /// Start and wait for the supervisor to finish
    ///
    /// # Errors
    /// See [`Supervisor::start`] and [`SupervisorHandle::wait`].
    pub async fn run(self) -> Result<(), SupervisorError> {
        let mut handle = self.start().await?;
        handle.wait().await
    }
}

/// Control surface of a running supervisor
#[derive(Debug)]
pub struct SupervisorHandle {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<Result<(), SupervisorError>>,
    journal: Journal,
}

impl SupervisorHandle {
    /// Send `shutdown` to every worker and stop once they are gone
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Current worker table; `None` once the loop has ended
    pub async fn snapshot(&self) -> Option<Vec<WorkerSummary>> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Decisions recorded so far
    #[inline]
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Check whether the control loop has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the control loop to end
    ///
    /// Cancel safe; must not be called again once it has returned.
    ///
    /// # Errors
    /// Returns the fatal condition that stopped the supervisor.
    pub async fn wait(&mut self) -> Result<(), SupervisorError> {
        (&mut self.task)
            .await
            .map_err(|_| SupervisorError::Terminated)?
    }
}

enum Control {
    Shutdown,
    Snapshot(oneshot::Sender<Vec<WorkerSummary>>),
}

enum Internal {
    ReplacementVersion {
        retiring: WorkerId,
        result: Result<VersionToken, OracleError>,
    },
    RetryReplacement {
        retiring: WorkerId,
    },
    RespawnVersion {
        previous: WorkerId,
        slot: SlotId,
        fallback: VersionToken,
        result: Result<VersionToken, OracleError>,
    },
    Exited {
        worker_id: WorkerId,
        code: Option<i32>,
    },
    GraceExpired {
        worker_id: WorkerId,
    },
    ReadyTimeout {
        worker_id: WorkerId,
    },
}

enum Wake {
    Bridge(Option<BridgeEvent>),
    Internal(Internal),
    Control(Option<Control>),
}

struct ControlLoop {
    config: SwitchConfig,
    oracle: Arc<dyn VersionOracle>,
    launcher: Arc<dyn Launcher>,
    journal: Journal,
    bridge: ControlBridge,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    next_id: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    restarts: RestartTracker,
    pending_respawns: usize,
    stopping: bool,
    host_delegated: bool,
}

impl ControlLoop {
    fn new(supervisor: Supervisor, bridge: ControlBridge) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let restarts = RestartTracker::new(supervisor.config.restart.clone());
        let host_delegated = supervisor.config.host_delegated == Some(true);
        Self {
            config: supervisor.config,
            oracle: supervisor.oracle,
            launcher: supervisor.launcher,
            journal: supervisor.journal,
            bridge,
            workers: BTreeMap::new(),
            next_id: 1,
            internal_tx,
            internal_rx,
            restarts,
            pending_respawns: 0,
            stopping: false,
            host_delegated,
        }
    }

    async fn run(
        mut self,
        mut bridge_events: mpsc::UnboundedReceiver<BridgeEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) -> Result<(), SupervisorError> {
        let mut control_open = true;

        loop {
            let wake = tokio::select! {
                event = bridge_events.recv() => Wake::Bridge(event),
                Some(event) = self.internal_rx.recv() => Wake::Internal(event),
                command = control.recv(), if control_open => Wake::Control(command),
            };

            let outcome = match wake {
                Wake::Bridge(Some(event)) => self.on_bridge_event(event).await,
                Wake::Bridge(None) => {
                    error!(addr = %self.bridge.endpoint().addr, "control bridge stopped");
                    self.terminate_all().await;
                    return Err(SupervisorError::Terminated);
                }
                Wake::Internal(event) => self.on_internal(event).await,
                Wake::Control(Some(Control::Shutdown)) => {
                    self.begin_shutdown();
                    Ok(())
                }
                Wake::Control(Some(Control::Snapshot(reply))) => {
                    let _ = reply.send(self.workers.values().map(WorkerHandle::summary).collect());
                    Ok(())
                }
                Wake::Control(None) => {
                    control_open = false;
                    Ok(())
                }
            };

            if let Err(err) = outcome {
                self.terminate_all().await;
                return Err(err);
            }

            if self.workers.is_empty() && self.pending_respawns == 0 {
                info!(stopping = self.stopping, "no workers left; supervisor exiting");
                return Ok(());
            }
        }
    }

    async fn on_bridge_event(&mut self, event: BridgeEvent) -> Result<(), SupervisorError> {
        match event {
            BridgeEvent::Connected {
                worker_id,
                commands,
            } => {
                let Some(handle) = self.workers.get_mut(&worker_id) else {
                    warn!(%worker_id, "dropping bridge connection for unknown worker");
                    return Ok(());
                };
                debug!(%worker_id, "worker connected to bridge");
                if handle.shutdown_sent {
                    let _ = commands.send(SupervisorCommand::Shutdown);
                }
                handle.commands = Some(commands);
                Ok(())
            }
            BridgeEvent::Message { worker_id, message } => {
                self.on_worker_message(worker_id, message).await
            }
            BridgeEvent::Closed { worker_id } => {
                if let Some(handle) = self.workers.get_mut(&worker_id) {
                    debug!(%worker_id, "worker bridge link closed");
                    handle.commands = None;
                }
                Ok(())
            }
        }
    }

    async fn on_worker_message(
        &mut self,
        worker_id: WorkerId,
        message: WorkerMessage,
    ) -> Result<(), SupervisorError> {
        match message {
            WorkerMessage::Listening => {
                self.on_listening(worker_id);
                Ok(())
            }
            WorkerMessage::Disconnect => {
                self.on_disconnect(worker_id);
                Ok(())
            }
            WorkerMessage::RunnerFailed { err } => Err(self.on_runner_failed(worker_id, err)),
            WorkerMessage::Hello { .. } => {
                debug!(%worker_id, "ignoring repeated hello");
                Ok(())
            }
        }
    }

    fn on_listening(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if handle.listening {
            return;
        }
        handle.listening = true;
        handle.awaiting_ready = false;
        if handle.state == WorkerState::Spawning {
            handle.transition(WorkerState::Listening);
        }
        let slot = handle.slot;
        let predecessor = handle.predecessor.take();
        self.journal.record(worker_id, slot, JournalEvent::Listening);
        info!(%worker_id, %slot, version = %handle.version, "worker listening");

        if let Some(predecessor) = predecessor {
            info!(%predecessor, successor = %worker_id, "successor ready; retiring predecessor");
            self.send_shutdown(predecessor);
        }
        self.resume_deferred_retirement(worker_id);
    }

    fn on_disconnect(&mut self, worker_id: WorkerId) {
        if self.host_delegated {
            debug!(%worker_id, "ignoring disconnect in host-delegated mode");
            return;
        }
        if self.stopping {
            return;
        }
        let Some(handle) = self.workers.get(&worker_id) else {
            return;
        };
        let slot = handle.slot;
        if handle.successor.is_some()
            || handle.shutdown_sent
            || handle.state == WorkerState::Retiring
        {
            debug!(%worker_id, %slot, "replacement already in flight; ignoring disconnect");
            return;
        }

        if self.slot_handover_in_flight(worker_id, slot) {
            // The gate is one-shot, so the request is kept until this worker
            // owns the slot.
            if let Some(handle) = self.workers.get_mut(&worker_id) {
                handle.pending_retirement = true;
            }
            info!(%worker_id, %slot, "drift reported during handover; retirement deferred");
            return;
        }

        self.start_retirement(worker_id);
    }

    /// Another worker of `slot` is still being replaced
    fn slot_handover_in_flight(&self, worker_id: WorkerId, slot: SlotId) -> bool {
        self.workers
            .values()
            .any(|w| w.id != worker_id && w.slot == slot && w.state == WorkerState::Retiring)
    }

    fn start_retirement(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if !handle.transition(WorkerState::Retiring) {
            return;
        }
        handle.pending_retirement = false;
        handle.replacement_attempts = 0;
        let slot = handle.slot;
        self.journal
            .record(worker_id, slot, JournalEvent::RetirementRequested);
        info!(%worker_id, %slot, version = %handle.version, "worker requested retirement");

        self.begin_replacement_attempt(worker_id);
    }

    /// Act on a drift report that arrived before `worker_id` owned its slot
    fn resume_deferred_retirement(&mut self, worker_id: WorkerId) {
        if self.stopping || self.host_delegated {
            return;
        }
        let Some(handle) = self.workers.get(&worker_id) else {
            return;
        };
        if !handle.pending_retirement || handle.shutdown_sent {
            return;
        }
        if self.slot_handover_in_flight(worker_id, handle.slot) {
            return;
        }
        info!(%worker_id, "slot handed over; starting deferred retirement");
        self.start_retirement(worker_id);
    }

    fn on_runner_failed(&mut self, worker_id: WorkerId, error: String) -> SupervisorError {
        let slot = self.workers.get(&worker_id).map_or(SlotId(0), |h| h.slot);
        self.journal.record(
            worker_id,
            slot,
            JournalEvent::RunnerFailed {
                error: error.clone(),
            },
        );
        error!(%worker_id, %slot, %error, "worker runner failed; stopping supervisor");

        if let Some(handle) = self.workers.get(&worker_id) {
            handle.request_kill();
            self.journal
                .record(worker_id, slot, JournalEvent::ForceKilled);
        }
        SupervisorError::RunnerFailed { worker_id, error }
    }

    fn begin_replacement_attempt(&mut self, retiring: WorkerId) {
        let Some(handle) = self.workers.get_mut(&retiring) else {
            return;
        };
        handle.replacement_attempts += 1;
        debug!(%retiring, attempt = handle.replacement_attempts, "fetching replacement version");

        let oracle = Arc::clone(&self.oracle);
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = oracle.fetch_version().await;
            let _ = events.send(Internal::ReplacementVersion { retiring, result });
        });
    }

    async fn on_internal(&mut self, event: Internal) -> Result<(), SupervisorError> {
        match event {
            Internal::ReplacementVersion { retiring, result } => {
                self.on_replacement_version(retiring, result).await;
                Ok(())
            }
            Internal::RetryReplacement { retiring } => {
                let retry = !self.stopping
                    && self.workers.get(&retiring).is_some_and(|h| {
                        h.state == WorkerState::Retiring && h.successor.is_none()
                    });
                if retry {
                    self.begin_replacement_attempt(retiring);
                }
                Ok(())
            }
            Internal::RespawnVersion {
                previous,
                slot,
                fallback,
                result,
            } => {
                self.pending_respawns = self.pending_respawns.saturating_sub(1);
                self.on_respawn_version(previous, slot, fallback, result)
                    .await
            }
            Internal::Exited { worker_id, code } => self.on_exited(worker_id, code),
            Internal::GraceExpired { worker_id } => {
                if let Some(handle) = self.workers.get(&worker_id) {
                    warn!(%worker_id, "grace period elapsed; killing worker");
                    handle.request_kill();
                    self.journal
                        .record(worker_id, handle.slot, JournalEvent::ForceKilled);
                }
                Ok(())
            }
            Internal::ReadyTimeout { worker_id } => {
                if let Some(handle) = self.workers.get(&worker_id) {
                    if handle.awaiting_ready && !handle.listening {
                        warn!(%worker_id, "successor never reported listening; killing it");
                        handle.request_kill();
                        self.journal
                            .record(worker_id, handle.slot, JournalEvent::ForceKilled);
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_replacement_version(
        &mut self,
        retiring: WorkerId,
        result: Result<VersionToken, OracleError>,
    ) {
        let Some(handle) = self.workers.get(&retiring) else {
            return;
        };
        if self.stopping || handle.state != WorkerState::Retiring {
            return;
        }
        let slot = handle.slot;

        let version = match result {
            Ok(version) => version,
            Err(err) => {
                self.replacement_failed(retiring, format!("version fetch failed: {err}"));
                return;
            }
        };

        match self.spawn_worker(slot, version, Some(retiring)).await {
            Ok(successor) => {
                if let Some(handle) = self.workers.get_mut(&retiring) {
                    handle.successor = Some(successor);
                }
            }
            Err(err) => self.replacement_failed(retiring, err.to_string()),
        }
    }

    /// Keep the retiring worker serving; retry or give up
    fn replacement_failed(&mut self, retiring: WorkerId, reason: String) {
        let max_attempts = self.config.replacement.max_attempts;
        let Some(handle) = self.workers.get_mut(&retiring) else {
            return;
        };
        handle.successor = None;
        let attempt = handle.replacement_attempts;
        let slot = handle.slot;

        warn!(%retiring, attempt, %reason, "replacement failed; worker keeps serving");
        self.journal.record(
            retiring,
            slot,
            JournalEvent::ReplacementFailed {
                attempt,
                reason,
            },
        );

        if self.stopping || handle.state != WorkerState::Retiring {
            return;
        }

        if attempt >= max_attempts {
            handle.transition(WorkerState::Listening);
            warn!(%retiring, attempts = attempt, "replacement abandoned; keeping current version");
            self.journal.record(
                retiring,
                slot,
                JournalEvent::ReplacementAbandoned { attempts: attempt },
            );
            return;
        }

        let delay = self.config.replacement.backoff.delay_for_attempt(attempt);
        self.schedule(delay, Internal::RetryReplacement { retiring });
    }

    async fn on_respawn_version(
        &mut self,
        previous: WorkerId,
        slot: SlotId,
        fallback: VersionToken,
        result: Result<VersionToken, OracleError>,
    ) -> Result<(), SupervisorError> {
        if self.stopping {
            return Ok(());
        }
        let version = result.unwrap_or_else(|err| {
            warn!(%slot, %err, %fallback, "respawn version fetch failed; reusing last version");
            fallback.clone()
        });

        match self.spawn_worker(slot, version.clone(), None).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(%slot, %err, "respawn failed");
                self.schedule_respawn(previous, slot, version)
            }
        }
    }

    fn on_exited(&mut self, worker_id: WorkerId, code: Option<i32>) -> Result<(), SupervisorError> {
        let Some(mut handle) = self.workers.remove(&worker_id) else {
            return Ok(());
        };
        handle.transition(WorkerState::Exited);
        let planned = handle.shutdown_sent;
        let slot = handle.slot;
        self.journal
            .record(worker_id, slot, JournalEvent::Exited { code, planned });
        info!(%worker_id, %slot, ?code, planned, "worker exited");

        if let Some(predecessor) = handle.predecessor {
            if let Some(retiring) = self.workers.get_mut(&predecessor) {
                if retiring.successor == Some(worker_id) {
                    retiring.successor = None;
                }
            }
            self.replacement_failed(predecessor, "successor exited before listening".to_string());
            return Ok(());
        }

        if let Some(successor) = handle.successor {
            let mut successor_listening = false;
            if let Some(next) = self.workers.get_mut(&successor) {
                next.predecessor = None;
                successor_listening = next.listening;
            }
            debug!(%worker_id, %successor, "retiring worker exited; successor takes the slot");
            if successor_listening {
                self.resume_deferred_retirement(successor);
            }
            return Ok(());
        }

        if planned || self.stopping || self.host_delegated {
            return Ok(());
        }

        self.schedule_respawn(worker_id, slot, handle.version)
    }

    fn schedule_respawn(
        &mut self,
        previous: WorkerId,
        slot: SlotId,
        fallback: VersionToken,
    ) -> Result<(), SupervisorError> {
        match self.restarts.on_unplanned_exit(slot) {
            RestartDecision::Respawn { delay, attempt } => {
                info!(%previous, %slot, attempt, ?delay, "respawning worker after unplanned exit");
                self.journal
                    .record(previous, slot, JournalEvent::Respawned { attempt });
                self.pending_respawns += 1;

                let oracle = Arc::clone(&self.oracle);
                let events = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let result = oracle.fetch_version().await;
                    let _ = events.send(Internal::RespawnVersion {
                        previous,
                        slot,
                        fallback,
                        result,
                    });
                });
                Ok(())
            }
            RestartDecision::GiveUp { restarts } => {
                error!(%slot, restarts, "restart budget exhausted; stopping supervisor");
                Err(SupervisorError::CrashLoop { slot, restarts })
            }
        }
    }

    async fn spawn_worker(
        &mut self,
        slot: SlotId,
        version: VersionToken,
        predecessor: Option<WorkerId>,
    ) -> Result<WorkerId, LaunchError> {
        let worker_id = WorkerId(self.next_id);
        self.next_id += 1;

        let request = LaunchRequest {
            worker_id,
            slot,
            version: version.clone(),
            bridge: self.bridge.endpoint().clone(),
        };
        let process = self.launcher.launch(request).await?;
        let pid = process.pid();

        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(watch_process(
            worker_id,
            process,
            kill_rx,
            self.internal_tx.clone(),
        ));

        info!(%worker_id, %slot, %version, ?pid, ?predecessor, "worker spawned");
        self.journal.record(
            worker_id,
            slot,
            JournalEvent::Spawned {
                version: version.clone(),
                predecessor,
            },
        );
        self.workers.insert(
            worker_id,
            WorkerHandle::new(worker_id, slot, version, pid, kill_tx, predecessor),
        );

        if predecessor.is_some() {
            self.schedule(self.config.ready_timeout(), Internal::ReadyTimeout { worker_id });
        }
        Ok(worker_id)
    }

    fn send_shutdown(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if handle.shutdown_sent {
            return;
        }
        handle.shutdown_sent = true;
        handle.transition(WorkerState::ShuttingDown);
        if let Some(commands) = &handle.commands {
            if commands.send(SupervisorCommand::Shutdown).is_err() {
                debug!(%worker_id, "worker link gone; relying on grace kill");
            }
        }
        let slot = handle.slot;
        self.journal
            .record(worker_id, slot, JournalEvent::ShutdownSent);
        debug!(%worker_id, grace = ?self.config.grace_period(), "shutdown sent");

        self.schedule(self.config.grace_period(), Internal::GraceExpired { worker_id });
    }

    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        info!(workers = self.workers.len(), "graceful shutdown requested");
        self.stopping = true;
        let ids: Vec<_> = self.workers.keys().copied().collect();
        for worker_id in ids {
            self.send_shutdown(worker_id);
        }
    }

    /// Kill every worker and wait, bounded by the grace period, for exits
    async fn terminate_all(&mut self) {
        self.stopping = true;
        for handle in self.workers.values() {
            handle.request_kill();
        }

        let deadline = Instant::now() + self.config.grace_period();
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.internal_rx.recv()).await {
                Ok(Some(Internal::Exited { worker_id, code })) => {
                    if let Some(handle) = self.workers.remove(&worker_id) {
                        self.journal.record(
                            worker_id,
                            handle.slot,
                            JournalEvent::Exited {
                                code,
                                planned: false,
                            },
                        );
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!(remaining = self.workers.len(), "workers still running at exit");
                    break;
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, event: Internal) {
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }
}

enum ProcessWake {
    Exited(std::io::Result<ExitOutcome>),
    Kill,
    KillClosed,
}

/// Owns one worker process until it exits
///
/// A closed kill channel means the supervisor is gone, which is treated as a
/// kill request.
async fn watch_process(
    worker_id: WorkerId,
    mut process: Box<dyn WorkerProcess>,
    mut kill: mpsc::Receiver<()>,
    events: mpsc::UnboundedSender<Internal>,
) {
    let mut kill_open = true;
    let outcome = loop {
        let wake = tokio::select! {
            outcome = process.wait() => ProcessWake::Exited(outcome),
            signal = kill.recv(), if kill_open => match signal {
                Some(()) => ProcessWake::Kill,
                None => ProcessWake::KillClosed,
            },
        };

        match wake {
            ProcessWake::Exited(outcome) => break outcome,
            ProcessWake::Kill => {
                if let Err(err) = process.start_kill() {
                    debug!(%worker_id, %err, "kill failed");
                }
            }
            ProcessWake::KillClosed => {
                kill_open = false;
                let _ = process.start_kill();
            }
        }
    };

    let code = match outcome {
        Ok(outcome) => outcome.code,
        Err(err) => {
            warn!(%worker_id, %err, "waiting on worker failed");
            None
        }
    };
    let _ = events.send(Internal::Exited { worker_id, code });
}
