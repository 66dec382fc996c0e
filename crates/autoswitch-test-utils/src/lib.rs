//! Testing utilities for the autoswitch workspace
//!
//! Oracles and launchers that let a whole supervisor tree run inside one
//! test process. Workers started by [`InProcessLauncher`] are tokio tasks,
//! but they talk to the supervisor over the real control bridge.

#![allow(missing_docs)]

use async_trait::async_trait;
use autoswitch_core::{
    ExitOutcome, Journal, JournalEntry, JournalEvent, LaunchError, LaunchRequest, Launcher,
    OracleError, RetirementTransport, TransportError, VersionOracle, VersionToken,
    WorkerAssignment, WorkerConfig, WorkerContext, WorkerExit, WorkerId, WorkerProcess,
    WorkerRuntime,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Route tracing output through the test harness
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Oracles and transports
// ---------------------------------------------------------------------------

/// Oracle whose answer the test controls
#[derive(Debug, Clone)]
pub struct MockOracle {
    state: Arc<Mutex<Option<VersionToken>>>,
    calls: Arc<AtomicUsize>,
}

impl MockOracle {
    pub fn new(version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(VersionToken::from(version)))),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Oracle that fails every query until `set` is called
    pub fn failing() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, version: &str) {
        *self.state.lock() = Some(VersionToken::from(version));
    }

    pub fn fail(&self) {
        *self.state.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionOracle for MockOracle {
    async fn fetch_version(&self) -> Result<VersionToken, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .clone()
            .ok_or_else(|| OracleError::failed("mock oracle unavailable"))
    }
}

/// Transport that counts signals and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingTransport {
    signals: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetirementTransport for RecordingTransport {
    async fn signal_retirement(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

pub type Workload = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap a closure as a [`Workload`]
pub fn workload<F, Fut>(f: F) -> Workload
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Runs each worker as a tokio task in this process
pub struct InProcessLauncher {
    oracle: Arc<dyn VersionOracle>,
    workload: Workload,
    drain_period: Duration,
    launched: Mutex<Vec<LaunchRequest>>,
}

impl InProcessLauncher {
    /// Workers query `oracle` and run `workload`
    pub fn new(oracle: Arc<dyn VersionOracle>, workload: Workload) -> Self {
        Self {
            oracle,
            workload,
            drain_period: Duration::from_millis(200),
            launched: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_drain_period(mut self, period: Duration) -> Self {
        self.drain_period = period;
        self
    }

    /// Versions of launched workers, in launch order
    pub fn launched_versions(&self) -> Vec<String> {
        self.launched
            .lock()
            .iter()
            .map(|r| r.version.to_string())
            .collect()
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        self.launched.lock().push(request.clone());

        let config = WorkerConfig::channel(WorkerAssignment {
            worker_id: request.worker_id,
            bridge: request.bridge.clone(),
            assigned_version: Some(request.version.clone()),
        })
        .with_drain_period(self.drain_period);
        let runtime = WorkerRuntime::new(config, Arc::clone(&self.oracle));
        let workload = Arc::clone(&self.workload);

        let task = tokio::spawn(runtime.run(move |ctx| workload(ctx)));
        Ok(Box::new(InProcessWorker { task, outcome: None }))
    }
}

struct InProcessWorker {
    task: JoinHandle<WorkerExit>,
    outcome: Option<ExitOutcome>,
}

#[async_trait]
impl WorkerProcess for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let outcome = match (&mut self.task).await {
            Ok(exit) => ExitOutcome {
                code: Some(exit.exit_code()),
            },
            Err(_) => ExitOutcome { code: None },
        };
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.task.abort();
        Ok(())
    }
}

/// Launcher that can be switched into failing every launch
pub struct FlakyLauncher<L> {
    inner: L,
    failing: AtomicBool,
    failures: AtomicUsize,
}

impl<L: Launcher> FlakyLauncher<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Launches refused so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: Launcher> Launcher for FlakyLauncher<L> {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(LaunchError::Other(format!(
                "launch of worker {} refused",
                request.worker_id
            )));
        }
        self.inner.launch(request).await
    }
}

// ---------------------------------------------------------------------------
// Request queue workload
// ---------------------------------------------------------------------------

const QUEUE_DEPTH: usize = 4096;

struct Request {
    reply: oneshot::Sender<VersionToken>,
}

#[derive(Default)]
struct RouterState {
    next: usize,
    endpoints: Vec<(WorkerId, mpsc::Sender<Request>)>,
}

/// Stand-in for a shared listening socket
///
/// Workers register while they serve and clients are dispatched round robin
/// across them. A worker drains its queue after unregistering, so a request
/// accepted by a retiring worker is still answered.
#[derive(Clone, Default)]
pub struct RequestQueue {
    state: Arc<Mutex<RouterState>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workload that serves this queue: one drift check per request, then
    /// reply with the worker's version
    pub fn workload(&self) -> Workload {
        let queue = self.clone();
        workload(move |ctx| queue.clone().serve(ctx))
    }

    async fn serve(self, ctx: WorkerContext) -> anyhow::Result<()> {
        let worker_id = ctx.worker_id().unwrap_or(WorkerId(0));
        let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        self.state.lock().endpoints.push((worker_id, tx));
        ctx.mark_listening().await;

        loop {
            tokio::select! {
                () = ctx.shutdown_requested() => break,
                request = rx.recv() => match request {
                    Some(request) => spawn_reply(&ctx, request),
                    None => break,
                },
            }
        }

        self.state.lock().endpoints.retain(|(id, _)| *id != worker_id);
        rx.close();
        while let Some(request) = rx.recv().await {
            spawn_reply(&ctx, request);
        }
        Ok(())
    }

    /// Number of workers currently accepting requests
    pub fn listeners(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Send one request; retries until `timeout` if no worker is available
    pub async fn request(&self, timeout: Duration) -> anyhow::Result<VersionToken> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(version) = self.request_once().await {
                return Ok(version);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("no worker answered within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Send one request with no retry
    ///
    /// Fails if no worker is registered, its queue is full, or the worker
    /// drops the request without answering.
    pub async fn request_once(&self) -> anyhow::Result<VersionToken> {
        let response = self.dispatch()?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("request dropped without an answer"))
    }

    /// Pick a worker and enqueue under the router lock, so a worker that
    /// unregisters either has the request queued for its drain or was never
    /// chosen
    fn dispatch(&self) -> anyhow::Result<oneshot::Receiver<VersionToken>> {
        let mut state = self.state.lock();
        if state.endpoints.is_empty() {
            anyhow::bail!("no worker is listening");
        }
        let index = state.next % state.endpoints.len();
        state.next = state.next.wrapping_add(1);

        let (reply, response) = oneshot::channel();
        state.endpoints[index]
            .1
            .try_send(Request { reply })
            .map_err(|err| anyhow::anyhow!("worker queue rejected request: {err}"))?;
        Ok(response)
    }
}

fn spawn_reply(ctx: &WorkerContext, request: Request) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = ctx.check_drift().await;
        let _ = request.reply.send(ctx.version().clone());
    });
}

// ---------------------------------------------------------------------------
// Journal helpers
// ---------------------------------------------------------------------------

/// Poll until `condition` holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for the first journal entry matching `predicate`
pub async fn wait_for_entry(
    journal: &Journal,
    timeout: Duration,
    predicate: impl Fn(&JournalEntry) -> bool,
) -> Option<JournalEntry> {
    let mut found = None;
    wait_for(timeout, || {
        found = journal.entries().into_iter().find(|e| predicate(e));
        found.is_some()
    })
    .await;
    found
}

/// All `Spawned` entries as `(worker, version)`
pub fn spawned(journal: &Journal) -> Vec<(WorkerId, String)> {
    journal
        .entries()
        .into_iter()
        .filter_map(|e| match e.event {
            JournalEvent::Spawned { version, .. } => Some((e.worker_id, version.to_string())),
            _ => None,
        })
        .collect()
}

/// Count entries matching `predicate`
pub fn count(journal: &Journal, predicate: impl Fn(&JournalEvent) -> bool) -> usize {
    journal.entries().iter().filter(|e| predicate(&e.event)).count()
}

/// Sequence number of `event` for `worker_id`
pub fn seq_of(journal: &Journal, worker_id: WorkerId, event: &JournalEvent) -> Option<u64> {
    journal.position(|e| e.worker_id == worker_id && &e.event == event)
}

/// Exit codes observed per worker
pub fn exits(journal: &Journal) -> HashMap<WorkerId, (Option<i32>, bool)> {
    journal
        .entries()
        .into_iter()
        .filter_map(|e| match e.event {
            JournalEvent::Exited { code, planned } => Some((e.worker_id, (code, planned))),
            _ => None,
        })
        .collect()
}
