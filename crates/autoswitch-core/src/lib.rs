//! autoswitch core - zero-downtime version switching
//!
//! A supervisor keeps a workload running in child processes and replaces
//! them when the expected version changes:
//! - each worker fixes its version at startup and consults a drift gate per
//!   unit of work
//! - the first observed drift sends one retirement signal
//! - the supervisor starts a successor and retires the old worker only after
//!   the successor reports listening
//! - a workload fault stops the whole tree with exit code 1
//!
//! # Example
//!
//! ```rust,ignore
//! use autoswitch_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> std::process::ExitCode {
//! let oracle = Arc::new(FileOracle::new("version.txt"));
//! let service = Service::new(SwitchConfig::new(), oracle, |ctx: WorkerContext| async move {
//!     ctx.mark_listening().await;
//!     while !ctx.is_shutting_down() {
//!         ctx.check_drift().await?;
//!         // serve one request with ctx.version()
//!     }
//!     Ok(())
//! });
//! service.run(&Environment::capture()).await.into()
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gate;
pub mod oracle;
pub mod protocol;
pub mod service;
/// Worker lifecycle states and the allowed transition table
pub mod state_machine;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod worker;

// Re-exports for convenience
pub use bootstrap::{Environment, Role};
pub use bridge::{BridgeEndpoint, BridgeEvent, ControlBridge, SupervisorLink};
pub use config::{
    BackoffConfig, ControlEndpoint, ReplacementConfig, RestartConfig, SwitchConfig, TransportMode,
};
pub use error::{
    ConfigError, LaunchError, LifecycleError, OracleError, ProtocolError, SupervisorError,
    SwitchError, TransportError, WorkerError,
};
pub use gate::DriftGate;
pub use oracle::{FileOracle, FnOracle, VersionOracle};
pub use protocol::{SupervisorCommand, WireMessage, WorkerMessage, RECYCLE_COMMAND};
pub use service::{Service, ServiceExit};
pub use state_machine::WorkerState;
pub use supervisor::{
    ExitOutcome, Journal, JournalEntry, JournalEvent, LaunchRequest, Launcher, ProcessLauncher,
    Supervisor, SupervisorHandle, WorkerProcess, WorkerSummary,
};
pub use transport::{ChannelTransport, HostControlTransport, RetirementTransport};
pub use types::{SlotId, VersionToken, WorkerId};
pub use worker::{WorkerAssignment, WorkerConfig, WorkerContext, WorkerExit, WorkerRuntime};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building a switchable service
    pub use crate::{
        Environment, FileOracle, FnOracle, Service, ServiceExit, SwitchConfig, VersionOracle,
        VersionToken, WorkerContext,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
