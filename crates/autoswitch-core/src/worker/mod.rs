//! Worker runtime
//!
//! Runs inside the child process and wraps the user's entry point:
//! - fetches the version once at startup (failure is fatal and reported)
//! - builds the drift gate over the configured retirement transport
//! - runs the entry point, catching errors and panics as workload faults
//! - on `shutdown`, stops new work and exits after the drain window

mod context;

pub use context::WorkerContext;

use crate::bridge::{BridgeEndpoint, SupervisorLink};
use crate::config::TransportMode;
use crate::error::WorkerError;
use crate::gate::DriftGate;
use crate::oracle::VersionOracle;
use crate::protocol::{SupervisorCommand, WorkerMessage};
use crate::transport::{ChannelTransport, HostControlTransport, RetirementTransport};
use crate::types::{VersionToken, WorkerId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Supervisor coordinates handed to a worker at spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    /// Id assigned by the supervisor
    pub worker_id: WorkerId,
    /// Where to reach the supervisor
    pub bridge: BridgeEndpoint,
    /// Version the supervisor expected at spawn time
    pub assigned_version: Option<VersionToken>,
}

/// Explicit worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retirement transport
    pub mode: TransportMode,
    /// Required in channel mode
    pub assignment: Option<WorkerAssignment>,
    /// Drain window after shutdown
    pub drain_period: Duration,
}

impl WorkerConfig {
    /// Channel-mode worker spawned by this system's supervisor
    #[must_use]
    pub fn channel(assignment: WorkerAssignment) -> Self {
        Self {
            mode: TransportMode::Channel,
            assignment: Some(assignment),
            drain_period: Duration::from_millis(1000),
        }
    }

    /// Worker managed by an external host
    #[must_use]
    pub fn host_delegated(endpoint: crate::config::ControlEndpoint) -> Self {
        Self {
            mode: TransportMode::HostDelegated(endpoint),
            assignment: None,
            drain_period: Duration::from_millis(1000),
        }
    }

    /// With drain period
    #[inline]
    #[must_use]
    pub fn with_drain_period(mut self, period: Duration) -> Self {
        self.drain_period = period;
        self
    }
}

/// How the worker ended
#[derive(Debug)]
pub enum WorkerExit {
    /// Entry point returned `Ok` without a shutdown request
    Completed,
    /// Shutdown requested and the drain finished
    Drained,
    /// Startup version fetch failed; entry point never ran
    StartupFailed(WorkerError),
    /// Entry point returned an error or panicked
    WorkloadFailed(WorkerError),
    /// Could not reach the supervisor
    LinkFailed(WorkerError),
}

impl WorkerExit {
    /// Process exit code
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed | Self::Drained => 0,
            Self::StartupFailed(_) | Self::WorkloadFailed(_) | Self::LinkFailed(_) => 1,
        }
    }

    /// Check for a clean exit
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Runs one worker
pub struct WorkerRuntime {
    config: WorkerConfig,
    oracle: Arc<dyn VersionOracle>,
}

impl WorkerRuntime {
    /// Create a runtime
    #[must_use]
    pub fn new(config: WorkerConfig, oracle: Arc<dyn VersionOracle>) -> Self {
        Self { config, oracle }
    }

    /// Run `entry` to completion
    ///
    /// `entry` receives the worker context and must keep running for as long
    /// as the workload serves. It should stop accepting work once
    /// [`WorkerContext::shutdown_requested`] resolves.
    pub async fn run<F, Fut>(self, entry: F) -> WorkerExit
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let worker_id = self.config.assignment.as_ref().map(|a| a.worker_id);

        let (link, mut commands, transport) = match self.connect().await {
            Ok(parts) => parts,
            Err(err) => {
                error!(%err, "worker could not reach supervisor");
                return WorkerExit::LinkFailed(err);
            }
        };

        let version = match self.oracle.fetch_version().await {
            Ok(version) => version,
            Err(err) => {
                let err = WorkerError::StartupVersion(err);
                error!(%err, "worker startup failed");
                report_failure(link.as_ref(), &err).await;
                return WorkerExit::StartupFailed(err);
            }
        };

        if let Some(assigned) = self
            .config
            .assignment
            .as_ref()
            .and_then(|a| a.assigned_version.as_ref())
        {
            if *assigned != version {
                warn!(%assigned, fetched = %version, "version moved between spawn and startup");
            }
        }

        info!(?worker_id, %version, transport = transport.name(), "worker starting");

        let gate = DriftGate::new(version.clone(), Arc::clone(&self.oracle), transport);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = WorkerContext::new(worker_id, version, gate, link.clone(), shutdown_rx);

        let mut entry_task = EntryTask(tokio::spawn(async move { entry(context).await }));
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let wake = tokio::select! {
                joined = &mut entry_task.0 => Wake::Entry(joined),
                command = next_command(&mut commands) => Wake::Command(command),
                () = drain_elapsed(drain_deadline) => Wake::DrainElapsed,
            };

            match wake {
                Wake::Entry(joined) => {
                    return finish(joined, drain_deadline.is_some(), link.as_ref()).await;
                }
                Wake::Command(Some(SupervisorCommand::Shutdown)) => {
                    if drain_deadline.is_none() {
                        info!(?worker_id, drain = ?self.config.drain_period, "shutdown received");
                        drain_deadline = Some(Instant::now() + self.config.drain_period);
                        let _ = shutdown_tx.send(true);
                    }
                }
                Wake::Command(None) => {
                    commands = None;
                    if drain_deadline.is_none() {
                        warn!(?worker_id, "supervisor link closed; draining");
                        drain_deadline = Some(Instant::now() + self.config.drain_period);
                        let _ = shutdown_tx.send(true);
                    }
                }
                Wake::DrainElapsed => {
                    entry_task.0.abort();
                    info!(?worker_id, "drain window elapsed; exiting");
                    return WorkerExit::Drained;
                }
            }
        }
    }

    async fn connect(
        &self,
    ) -> Result<
        (
            Option<SupervisorLink>,
            Option<mpsc::UnboundedReceiver<SupervisorCommand>>,
            Arc<dyn RetirementTransport>,
        ),
        WorkerError,
    > {
        match &self.config.mode {
            TransportMode::HostDelegated(endpoint) => Ok((
                None,
                None,
                Arc::new(HostControlTransport::new(endpoint.clone())),
            )),
            TransportMode::Channel => {
                let assignment = self.config.assignment.as_ref().ok_or(WorkerError::Link(
                    crate::error::ProtocolError::MissingHandshake,
                ))?;
                let (link, commands) =
                    SupervisorLink::connect(&assignment.bridge, assignment.worker_id)
                        .await
                        .map_err(WorkerError::Link)?;
                let transport = Arc::new(ChannelTransport::new(link.clone()));
                Ok((Some(link), Some(commands), transport))
            }
        }
    }
}

/// The workload dies with the runtime, even when the runtime itself is
/// dropped mid-flight.
struct EntryTask(JoinHandle<anyhow::Result<()>>);

impl Drop for EntryTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Wake {
    Entry(Result<anyhow::Result<()>, JoinError>),
    Command(Option<SupervisorCommand>),
    DrainElapsed,
}

async fn next_command(
    commands: &mut Option<mpsc::UnboundedReceiver<SupervisorCommand>>,
) -> Option<SupervisorCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drain_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn finish(
    joined: Result<anyhow::Result<()>, JoinError>,
    draining: bool,
    link: Option<&SupervisorLink>,
) -> WorkerExit {
    let err = match joined {
        Ok(Ok(())) if draining => {
            info!("workload stopped after shutdown");
            return WorkerExit::Drained;
        }
        Ok(Ok(())) => {
            info!("workload completed");
            return WorkerExit::Completed;
        }
        Ok(Err(err)) => WorkerError::Workload(format!("{err:#}")),
        Err(join) if join.is_panic() => WorkerError::Panicked(panic_message(join)),
        Err(_) => return WorkerExit::Drained,
    };

    if draining {
        warn!(%err, "workload failed while draining");
        return WorkerExit::Drained;
    }

    error!(%err, "workload fault");
    report_failure(link, &err).await;
    WorkerExit::WorkloadFailed(err)
}

async fn report_failure(link: Option<&SupervisorLink>, err: &WorkerError) {
    let Some(link) = link else {
        return;
    };
    let message = WorkerMessage::RunnerFailed {
        err: err.to_string(),
    };
    if let Err(send_err) = link.send(&message).await {
        warn!(%send_err, "failed to report runner failure");
    }
}

fn panic_message(join: JoinError) -> String {
    let payload = join.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeEvent, ControlBridge};
    use crate::error::OracleError;
    use crate::oracle::FnOracle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    fn fixed_oracle(version: &'static str) -> Arc<dyn VersionOracle> {
        Arc::new(FnOracle::new(move || async move {
            Ok(VersionToken::from(version))
        }))
    }

    async fn connected_runtime(
        oracle: Arc<dyn VersionOracle>,
    ) -> (
        ControlBridge,
        mpsc::UnboundedReceiver<BridgeEvent>,
        WorkerRuntime,
    ) {
        let (bridge, events) = ControlBridge::bind().await.unwrap();
        let config = WorkerConfig::channel(WorkerAssignment {
            worker_id: WorkerId(1),
            bridge: bridge.endpoint().clone(),
            assigned_version: None,
        })
        .with_drain_period(Duration::from_millis(100));
        (bridge, events, WorkerRuntime::new(config, oracle))
    }

    async fn messages_until_closed(
        events: &mut mpsc::UnboundedReceiver<BridgeEvent>,
    ) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
            match event {
                BridgeEvent::Message { message, .. } => messages.push(message),
                BridgeEvent::Closed { .. } => break,
                BridgeEvent::Connected { .. } => {}
            }
        }
        messages
    }

    #[tokio::test]
    async fn startup_fetch_failure_never_runs_entry() {
        let oracle: Arc<dyn VersionOracle> = Arc::new(FnOracle::new(|| async {
            Err(OracleError::failed("version file missing"))
        }));
        let (_bridge, mut events, runtime) = connected_runtime(oracle).await;

        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let exit = runtime
            .run(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(exit, WorkerExit::StartupFailed(_)));
        assert_eq!(exit.exit_code(), 1);
        assert!(!entered.load(Ordering::SeqCst));

        let messages = messages_until_closed(&mut events).await;
        assert!(matches!(
            messages.as_slice(),
            [WorkerMessage::RunnerFailed { err }] if err.contains("version file missing")
        ));
    }

    #[tokio::test]
    async fn workload_error_is_reported() {
        let (_bridge, mut events, runtime) = connected_runtime(fixed_oracle("v1")).await;

        let exit = runtime
            .run(|_ctx| async { anyhow::bail!("I told you I'd throw") })
            .await;

        assert!(matches!(exit, WorkerExit::WorkloadFailed(WorkerError::Workload(_))));
        let messages = messages_until_closed(&mut events).await;
        assert!(matches!(
            messages.as_slice(),
            [WorkerMessage::RunnerFailed { err }] if err.contains("I told you I'd throw")
        ));
    }

    #[tokio::test]
    async fn workload_panic_is_reported() {
        let (_bridge, mut events, runtime) = connected_runtime(fixed_oracle("v1")).await;

        let exit = runtime
            .run(|_ctx| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                panic!("late failure");
            })
            .await;

        assert!(matches!(exit, WorkerExit::WorkloadFailed(WorkerError::Panicked(ref m)) if m == "late failure"));
        let messages = messages_until_closed(&mut events).await;
        assert!(matches!(messages.as_slice(), [WorkerMessage::RunnerFailed { .. }]));
    }

    #[tokio::test]
    async fn shutdown_drains_then_exits() {
        let (_bridge, mut events, runtime) = connected_runtime(fixed_oracle("v1")).await;

        let worker = tokio::spawn(runtime.run(|ctx| async move {
            ctx.mark_listening().await;
            ctx.mark_listening().await;
            // Ignores shutdown on purpose: the drain timer must end it.
            std::future::pending::<()>().await;
            Ok(())
        }));

        let commands = loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(BridgeEvent::Connected { commands, .. }) => break commands,
                Some(_) => {}
                None => panic!("bridge closed"),
            }
        };
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(BridgeEvent::Message { message, .. }) => {
                assert_eq!(message, WorkerMessage::Listening);
            }
            other => panic!("unexpected event {other:?}"),
        }

        commands.send(SupervisorCommand::Shutdown).unwrap();
        let exit = timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Drained));
        assert_eq!(exit.exit_code(), 0);

        let rest = messages_until_closed(&mut events).await;
        assert!(rest.is_empty(), "listening must be sent once, got {rest:?}");
    }

    #[tokio::test]
    async fn cooperative_workload_stops_on_shutdown() {
        let (_bridge, mut events, runtime) = connected_runtime(fixed_oracle("v1")).await;

        let worker = tokio::spawn(runtime.run(|ctx| async move {
            ctx.mark_listening().await;
            ctx.shutdown_requested().await;
            assert!(ctx.is_shutting_down());
            Ok(())
        }));

        let commands = loop {
            if let Some(BridgeEvent::Connected { commands, .. }) =
                timeout(Duration::from_secs(5), events.recv()).await.unwrap()
            {
                break commands;
            }
        };
        commands.send(SupervisorCommand::Shutdown).unwrap();

        let exit = timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Drained));
    }

    #[tokio::test]
    async fn missing_supervisor_is_link_failure() {
        let (bridge, _events) = ControlBridge::bind().await.unwrap();
        let mut endpoint = bridge.endpoint().clone();
        drop(bridge);
        endpoint.addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let config = WorkerConfig::channel(WorkerAssignment {
            worker_id: WorkerId(1),
            bridge: endpoint,
            assigned_version: None,
        });
        let exit = WorkerRuntime::new(config, fixed_oracle("v1"))
            .run(|_ctx| async { Ok(()) })
            .await;

        assert!(matches!(exit, WorkerExit::LinkFailed(_)));
    }

    #[tokio::test]
    async fn host_delegated_gate_writes_recycle() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = crate::config::ControlEndpoint::Tcp(listener.local_addr().unwrap());
        let host = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let oracle: Arc<dyn VersionOracle> = Arc::new(FnOracle::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(VersionToken::from(if n == 0 { "1.0" } else { "2.0" })) }
        }));

        let exit = WorkerRuntime::new(WorkerConfig::host_delegated(endpoint), oracle)
            .run(|ctx| async move {
                assert!(ctx.worker_id().is_none());
                ctx.mark_listening().await;
                ctx.check_drift().await?;
                ctx.check_drift().await?;
                assert!(ctx.gate().signal_sent());
                Ok(())
            })
            .await;

        assert!(matches!(exit, WorkerExit::Completed));
        assert_eq!(host.await.unwrap(), b"recycle");
    }
}
