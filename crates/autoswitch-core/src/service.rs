//! Process entry point
//!
//! `Service::run` resolves the role once and runs the matching side:
//! the supervisor control loop, a bridge-connected worker, or a worker
//! managed by an external host.

use crate::bootstrap::{Environment, Role};
use crate::config::SwitchConfig;
use crate::error::SwitchError;
use crate::oracle::VersionOracle;
use crate::supervisor::{Launcher, ProcessLauncher, Supervisor};
use crate::worker::{WorkerConfig, WorkerContext, WorkerExit, WorkerRuntime};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// How the process ends
#[derive(Debug)]
pub enum ServiceExit {
    /// Supervisor stopped on request
    Graceful,
    /// This process was a worker
    Worker(WorkerExit),
    /// Fatal error
    Failed(SwitchError),
}

impl ServiceExit {
    /// Process exit code
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Graceful => 0,
            Self::Worker(exit) => exit.exit_code(),
            Self::Failed(err) => err.exit_code(),
        }
    }
}

impl From<ServiceExit> for ExitCode {
    fn from(exit: ServiceExit) -> Self {
        Self::from(u8::try_from(exit.code()).unwrap_or(1))
    }
}

/// A workload together with its version source
pub struct Service<F> {
    config: SwitchConfig,
    oracle: Arc<dyn VersionOracle>,
    entry: F,
    launcher: Option<Arc<dyn Launcher>>,
    handle_signals: bool,
}

impl<F, Fut> Service<F>
where
    F: FnOnce(WorkerContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    /// Create a service
    #[must_use]
    pub fn new(config: SwitchConfig, oracle: Arc<dyn VersionOracle>, entry: F) -> Self {
        Self {
            config,
            oracle,
            entry,
            launcher: None,
            handle_signals: true,
        }
    }

    /// Use a custom launcher instead of re-executing this binary
    #[inline]
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Turn Ctrl-C / SIGTERM handling in the supervisor on or off
    #[inline]
    #[must_use]
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Run as whatever `env` says this process is
    pub async fn run(self, env: &Environment) -> ServiceExit {
        let role = match env.role(&self.config) {
            Ok(role) => role,
            Err(err) => {
                error!(%err, "cannot determine process role");
                return ServiceExit::Failed(err.into());
            }
        };

        match role {
            Role::Supervisor => self.run_supervisor().await,
            Role::Worker(assignment) => {
                let config = WorkerConfig::channel(assignment)
                    .with_drain_period(self.config.drain_period());
                ServiceExit::Worker(WorkerRuntime::new(config, self.oracle).run(self.entry).await)
            }
            Role::HostDelegated(endpoint) => {
                info!(%endpoint, "host-delegated mode; running worker directly");
                let config = WorkerConfig::host_delegated(endpoint)
                    .with_drain_period(self.config.drain_period());
                ServiceExit::Worker(WorkerRuntime::new(config, self.oracle).run(self.entry).await)
            }
        }
    }

    async fn run_supervisor(self) -> ServiceExit {
        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None => match ProcessLauncher::current_exe() {
                Ok(launcher) => Arc::new(launcher),
                Err(err) => return ServiceExit::Failed(err.into()),
            },
        };

        let mut handle = match Supervisor::new(self.config, self.oracle, launcher)
            .start()
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                error!(%err, "supervisor failed to start");
                return ServiceExit::Failed(err.into());
            }
        };

        let finished = if self.handle_signals {
            tokio::select! {
                result = handle.wait() => Some(result),
                () = shutdown_signal() => None,
            }
        } else {
            Some(handle.wait().await)
        };

        let result = match finished {
            Some(result) => result,
            None => {
                info!("termination signal received");
                handle.shutdown();
                handle.wait().await
            }
        };

        match result {
            Ok(()) => ServiceExit::Graceful,
            Err(err) => {
                error!(%err, "supervisor stopped");
                ServiceExit::Failed(err.into())
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
