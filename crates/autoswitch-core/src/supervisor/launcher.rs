//! Worker launch seam
//!
//! The supervisor never touches `tokio::process` directly. It asks a
//! [`Launcher`] for a [`WorkerProcess`] and hands that to a watcher task,
//! which is the only owner of the process from then on.

use crate::bootstrap::{SUPERVISOR_VAR, TOKEN_VAR, VERSION_VAR, WORKER_ID_VAR};
use crate::bridge::BridgeEndpoint;
use crate::error::LaunchError;
use crate::types::{SlotId, VersionToken, WorkerId};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Everything a launcher needs to start one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Id assigned by the supervisor
    pub worker_id: WorkerId,
    /// Slot the worker will serve
    pub slot: SlotId,
    /// Version assigned at spawn
    pub version: VersionToken,
    /// Bridge the worker must connect to
    pub bridge: BridgeEndpoint,
}

impl LaunchRequest {
    /// Environment handed to the child
    #[must_use]
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            (VERSION_VAR, self.version.to_string()),
            (SUPERVISOR_VAR, self.bridge.addr.to_string()),
            (WORKER_ID_VAR, self.worker_id.to_string()),
            (TOKEN_VAR, self.bridge.token.clone()),
        ]
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; `None` when killed by a signal or unknown
    pub code: Option<i32>,
}

impl ExitOutcome {
    /// Check for exit code 0
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running worker, owned by its watcher task
#[async_trait::async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, when there is one
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to end; must be cancel safe
    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;

    /// Begin terminating the worker without waiting
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// Starts workers
#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    /// Start one worker
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// Launches workers as child processes
///
/// [`ProcessLauncher::current_exe`] re-executes the running binary with its
/// own arguments, so the child takes the worker branch of bootstrap.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// Launch `program` with `args`
    #[must_use]
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Launch copies of the current executable
    ///
    /// # Errors
    /// Returns `LaunchError::CurrentExe` if the executable path is unknown.
    pub fn current_exe() -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }
}

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(request.env())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            worker_id: request.worker_id,
            source,
        })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait::async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(ExitOutcome {
            code: status.code(),
        })
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
